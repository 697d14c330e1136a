//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Trade and candle record encoding.
pub mod codec;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Kraken WebSocket trade feed.
pub mod kraken;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Candle sink adapters.
pub mod sink;

/// Trade source adapters.
pub mod source;

/// OpenTelemetry tracing integration.
pub mod telemetry;
