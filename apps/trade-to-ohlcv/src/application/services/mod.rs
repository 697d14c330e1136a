//! Application Services
//!
//! - `pipeline`: the ingest → aggregate → emit driver and its lifecycle
//! - `backoff`: retry delays for emission and feed reconnection

pub mod backoff;
pub mod pipeline;

pub use backoff::{BackoffConfig, BackoffPolicy};
pub use pipeline::{
    DriverConfig, PipelineDriver, PipelineError, PipelineState, PipelineStatus, RunSummary,
    StatusSnapshot,
};
