//! Record Codec
//!
//! JSON encoding for trades entering the pipeline and candles leaving it.
//!
//! # Trade record
//!
//! ```json
//! {"symbol": "BTC/USD", "price": 64250.1, "quantity": 0.01, "timestamp_ms": 1718617538494}
//! ```
//!
//! `product_id` is accepted for `symbol` and `qty` for `quantity`, matching
//! the trade topic layout used by the upstream producer.
//!
//! # Candle record
//!
//! Carries `timestamp_ms` equal to the window end, the event time used by
//! downstream feature stores.

use serde::{Deserialize, Serialize};

use crate::domain::market::{Candle, Trade, TradeError};

/// Codec failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Payload was not valid JSON for the record type.
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload parsed but the trade was invalid.
    #[error("invalid trade: {0}")]
    InvalidTrade(#[from] TradeError),
}

/// Wire representation of a trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Instrument identifier.
    #[serde(alias = "product_id")]
    pub symbol: String,
    /// Execution price.
    pub price: f64,
    /// Executed quantity.
    #[serde(alias = "qty")]
    pub quantity: f64,
    /// Event time in Unix milliseconds.
    pub timestamp_ms: i64,
}

impl TryFrom<TradeRecord> for Trade {
    type Error = TradeError;

    fn try_from(record: TradeRecord) -> Result<Self, Self::Error> {
        Self::new(record.symbol, record.price, record.quantity, record.timestamp_ms)
    }
}

impl From<&Trade> for TradeRecord {
    fn from(trade: &Trade) -> Self {
        Self {
            symbol: trade.symbol().to_string(),
            price: trade.price(),
            quantity: trade.quantity(),
            timestamp_ms: trade.timestamp_ms(),
        }
    }
}

/// Wire representation of a finalized candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleRecord {
    /// Instrument identifier.
    pub symbol: String,
    /// Inclusive window start.
    pub window_start_ms: i64,
    /// Exclusive window end.
    pub window_end_ms: i64,
    /// Event time for downstream consumers (window end).
    pub timestamp_ms: i64,
    /// Opening price.
    pub open: f64,
    /// Highest price.
    pub high: f64,
    /// Lowest price.
    pub low: f64,
    /// Closing price.
    pub close: f64,
    /// Total quantity.
    pub volume: f64,
    /// Number of trades.
    pub trade_count: i64,
}

impl From<&Candle> for CandleRecord {
    fn from(candle: &Candle) -> Self {
        Self {
            symbol: candle.symbol().to_string(),
            window_start_ms: candle.window_start_ms(),
            window_end_ms: candle.window_end_ms(),
            timestamp_ms: candle.window_end_ms(),
            open: candle.open_price(),
            high: candle.high(),
            low: candle.low(),
            close: candle.close(),
            volume: candle.volume(),
            trade_count: candle.trade_count(),
        }
    }
}

/// Decode and validate one trade record.
///
/// # Errors
///
/// Returns `CodecError` if the payload is not a trade record or fails
/// trade validation.
pub fn decode_trade(payload: &str) -> Result<Trade, CodecError> {
    let record: TradeRecord = serde_json::from_str(payload)?;
    Ok(Trade::try_from(record)?)
}

/// Encode one candle as a single-line JSON record.
///
/// # Errors
///
/// Returns `CodecError::Json` if serialization fails.
pub fn encode_candle(candle: &Candle) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&CandleRecord::from(candle))?)
}
