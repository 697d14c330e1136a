//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the pipeline driver and the port interfaces
//! that define how the aggregation core talks to external systems.

/// Port interfaces for trade sources and candle sinks.
pub mod ports;

/// Pipeline driver and retry policy.
pub mod services;
