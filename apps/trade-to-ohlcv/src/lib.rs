#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Trade to OHLCV - Windowed Candle Aggregator
//!
//! Consumes a trade tape, folds trades into tumbling-window OHLCV candles
//! per symbol and hands each candle downstream once its window can no
//! longer change.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure aggregation logic
//!   - `market`: trades, candles, window keys
//!   - `window`: watermark-driven tumbling-window aggregator
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: `TradeSource` and `CandleSink` contracts
//!   - `services`: pipeline driver and retry backoff
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `kraken`: live WebSocket trade feed
//!   - `source` / `sink`: JSON lines and channel adapters
//!   - `codec`: trade and candle record encoding
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! Kraken WS ──► FeedSource ──┐
//!                            ├──► PipelineDriver ──► WindowAggregator
//! stdin/file ──► JsonLines ──┘          │
//!                                       └──► CandleSink (stdout/file/channel)
//!                                       └──► ack(position) after emit
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Aggregation types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{
    Candle, MAX_TIMESTAMP_MS, Trade, TradeError, WindowKey, align_window_start,
};
pub use domain::window::{
    AggregatorStats, MAX_WINDOW_DURATION_MS, WindowAggregator, WindowConfig, WindowConfigError,
};

// Ports
pub use application::ports::{
    CandleSink, EmitError, SourceError, SourcePoll, SourcePosition, SourceRecord, TradeSource,
};

// Driver
pub use application::services::{
    BackoffConfig, BackoffPolicy, DriverConfig, PipelineDriver, PipelineError, PipelineState,
    PipelineStatus, RunSummary, StatusSnapshot,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, PipelineConfig, SinkKind, SourceKind};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
