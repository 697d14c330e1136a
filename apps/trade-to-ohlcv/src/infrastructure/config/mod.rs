//! Configuration Module
//!
//! Configuration loading for the aggregator service.

mod settings;

pub use settings::{
    ConfigError, DEFAULT_KRAKEN_WS_URL, FeedSettings, PipelineConfig, ServerSettings, SinkKind,
    SinkSettings, SourceKind, SourceSettings, parse_symbols,
};
