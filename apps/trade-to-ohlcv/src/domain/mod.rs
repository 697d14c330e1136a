//! Domain Layer - Core aggregation types and logic.
//!
//! This layer contains the trade/candle value types and the windowed
//! aggregation engine. Nothing here performs IO or awaits.

/// Trade, candle and window key types.
pub mod market;

/// Watermark-driven tumbling window aggregation.
pub mod window;
