//! Port Interfaces
//!
//! Defines the interfaces (ports) between the aggregation core and the
//! outside world, following the Hexagonal Architecture pattern. These are
//! the contracts that infrastructure adapters must implement.
//!
//! ## Driving Port (Inbound)
//!
//! - `TradeSource`: yields trades with an input position, accepts
//!   acknowledgements once a position has been fully processed downstream
//!
//! ## Driven Port (Outbound)
//!
//! - `CandleSink`: receives finalized candles for publication
//!
//! Both ports are owned exclusively by the pipeline driver's processing
//! loop, so their methods take `&mut self`.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::market::{Candle, Trade};

// =============================================================================
// Source Types
// =============================================================================

/// Position of a record in its source (line number, feed sequence, offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SourcePosition(pub u64);

impl SourcePosition {
    /// Raw position value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded trade and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    /// The trade.
    pub trade: Trade,
    /// Input position to acknowledge once the trade is fully processed.
    pub position: SourcePosition,
}

/// Result of a bounded poll.
#[derive(Debug, Clone, PartialEq)]
pub enum SourcePoll {
    /// A trade is available.
    Record(SourceRecord),
    /// Nothing arrived before the poll timeout.
    NoData,
    /// The source is finite and has no more records.
    Exhausted,
}

/// Source failures that the driver cannot absorb.
///
/// Malformed payloads are not errors at this level: sources skip them.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Initial connection or subscription failed.
    #[error("source connection failed: {0}")]
    Connect(String),

    /// The upstream feed went away and will not come back.
    #[error("source disconnected: {0}")]
    Disconnected(String),

    /// Reading the input failed.
    #[error("source IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisting or loading the committed position failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

/// Port for pulling trades into the pipeline.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradeSource: Send {
    /// Establish and validate the connection.
    ///
    /// Called once while the pipeline is starting.
    async fn connect(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Wait up to `timeout` for the next trade.
    ///
    /// Implementations must skip malformed payloads (log + count) rather
    /// than returning an error.
    async fn next(&mut self, timeout: Duration) -> Result<SourcePoll, SourceError>;

    /// Durably record that every record up to `position` has been processed.
    async fn ack(&mut self, position: SourcePosition) -> Result<(), SourceError>;
}

// =============================================================================
// Sink Types
// =============================================================================

/// Candle emission failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmitError {
    /// Temporary failure; the same candle may be retried.
    #[error("transient emit failure: {0}")]
    Transient(String),

    /// Permanent failure; retrying will not help.
    #[error("emit rejected: {0}")]
    Rejected(String),
}

impl EmitError {
    /// Whether the emission may succeed if retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Port for publishing finalized candles.
#[async_trait]
pub trait CandleSink: Send {
    /// Establish and validate the connection.
    async fn connect(&mut self) -> Result<(), EmitError> {
        Ok(())
    }

    /// Hand one finalized candle downstream.
    async fn emit(&mut self, candle: &Candle) -> Result<(), EmitError>;

    /// Flush and release resources at shutdown.
    async fn close(&mut self) -> Result<(), EmitError> {
        Ok(())
    }
}
