//! Market Data Types
//!
//! Core value types for the aggregation engine: executed trades, OHLCV
//! candles and the window key that ties one to the other.
//!
//! # Ownership
//!
//! A `Trade` is immutable once constructed and is handed between components
//! by value. A `Candle` is only ever mutated by the window aggregator that
//! owns it; once finalized it is moved out and never touched again.

use std::fmt;

// =============================================================================
// Trade
// =============================================================================

/// Validation failures when constructing a [`Trade`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TradeError {
    /// Symbol was empty or whitespace.
    #[error("trade symbol cannot be empty")]
    EmptySymbol,

    /// Price was NaN, infinite, zero or negative.
    #[error("trade price must be finite and positive, got {0}")]
    InvalidPrice(f64),

    /// Quantity was NaN, infinite, zero or negative.
    #[error("trade quantity must be finite and positive, got {0}")]
    InvalidQuantity(f64),

    /// Timestamp outside `±MAX_TIMESTAMP_MS`.
    #[error("trade timestamp {0}ms is out of range")]
    TimestampOutOfRange(i64),
}

/// Largest accepted event time magnitude (9999-12-31T23:59:59.999Z).
///
/// Together with `MAX_WINDOW_DURATION_MS` this keeps every window boundary
/// representable as `i64`.
pub const MAX_TIMESTAMP_MS: i64 = 253_402_300_799_999;

/// A single executed trade.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    symbol: String,
    price: f64,
    quantity: f64,
    timestamp_ms: i64,
}

impl Trade {
    /// Create a validated trade.
    ///
    /// # Errors
    ///
    /// Returns `TradeError` if the symbol is empty, price/quantity are not
    /// finite positive numbers, or the timestamp is out of range.
    pub fn new(
        symbol: impl Into<String>,
        price: f64,
        quantity: f64,
        timestamp_ms: i64,
    ) -> Result<Self, TradeError> {
        let symbol = symbol.into();
        if symbol.trim().is_empty() {
            return Err(TradeError::EmptySymbol);
        }
        if !price.is_finite() || price <= 0.0 {
            return Err(TradeError::InvalidPrice(price));
        }
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(TradeError::InvalidQuantity(quantity));
        }
        if !(-MAX_TIMESTAMP_MS..=MAX_TIMESTAMP_MS).contains(&timestamp_ms) {
            return Err(TradeError::TimestampOutOfRange(timestamp_ms));
        }

        Ok(Self {
            symbol,
            price,
            quantity,
            timestamp_ms,
        })
    }

    /// Instrument identifier.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Execution price.
    #[must_use]
    pub const fn price(&self) -> f64 {
        self.price
    }

    /// Executed quantity.
    #[must_use]
    pub const fn quantity(&self) -> f64 {
        self.quantity
    }

    /// Event time in Unix milliseconds.
    #[must_use]
    pub const fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

// =============================================================================
// Window Key
// =============================================================================

/// Align a timestamp to the start of its tumbling window.
///
/// Uses floor semantics, so a trade exactly on a boundary belongs to the
/// window starting at that boundary and pre-epoch timestamps round down.
/// Saturates instead of overflowing; validated trades and window configs
/// never reach the saturation point.
#[must_use]
pub const fn align_window_start(timestamp_ms: i64, window_duration_ms: i64) -> i64 {
    timestamp_ms
        .div_euclid(window_duration_ms)
        .saturating_mul(window_duration_ms)
}

/// Identity of one in-flight candle.
///
/// Ordered by window start first so that iterating a sorted map of keys
/// visits the oldest windows first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    /// Inclusive window start in Unix milliseconds.
    pub window_start_ms: i64,
    /// Instrument identifier.
    pub symbol: String,
}

impl WindowKey {
    /// Derive the window key for a trade.
    #[must_use]
    pub fn for_trade(trade: &Trade, window_duration_ms: i64) -> Self {
        Self {
            window_start_ms: align_window_start(trade.timestamp_ms, window_duration_ms),
            symbol: trade.symbol.clone(),
        }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.window_start_ms)
    }
}

// =============================================================================
// Candle
// =============================================================================

/// OHLCV aggregate over the half-open interval `[window_start_ms, window_end_ms)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    symbol: String,
    window_start_ms: i64,
    window_end_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    trade_count: i64,
}

impl Candle {
    /// Open a candle from the first trade of its window.
    pub(crate) fn open(key: WindowKey, window_duration_ms: i64, trade: &Trade) -> Self {
        Self {
            symbol: key.symbol,
            window_start_ms: key.window_start_ms,
            window_end_ms: key.window_start_ms.saturating_add(window_duration_ms),
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.quantity,
            trade_count: 1,
        }
    }

    /// Fold a subsequent trade of the same window into the aggregate.
    pub(crate) fn apply(&mut self, trade: &Trade) {
        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);
        self.close = trade.price;
        self.volume += trade.quantity;
        self.trade_count += 1;
    }

    /// Instrument identifier.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Inclusive window start in Unix milliseconds.
    #[must_use]
    pub const fn window_start_ms(&self) -> i64 {
        self.window_start_ms
    }

    /// Exclusive window end in Unix milliseconds.
    #[must_use]
    pub const fn window_end_ms(&self) -> i64 {
        self.window_end_ms
    }

    /// Price of the first trade applied.
    #[must_use]
    pub const fn open_price(&self) -> f64 {
        self.open
    }

    /// Highest price applied.
    #[must_use]
    pub const fn high(&self) -> f64 {
        self.high
    }

    /// Lowest price applied.
    #[must_use]
    pub const fn low(&self) -> f64 {
        self.low
    }

    /// Price of the last trade applied.
    #[must_use]
    pub const fn close(&self) -> f64 {
        self.close
    }

    /// Sum of applied quantities.
    #[must_use]
    pub const fn volume(&self) -> f64 {
        self.volume
    }

    /// Number of trades applied.
    #[must_use]
    pub const fn trade_count(&self) -> i64 {
        self.trade_count
    }

    /// Key this candle is stored under.
    #[must_use]
    pub fn key(&self) -> WindowKey {
        WindowKey {
            window_start_ms: self.window_start_ms,
            symbol: self.symbol.clone(),
        }
    }

    /// Check the OHLCV bounds invariant.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.low <= self.high
            && self.high >= self.open
            && self.high >= self.close
            && self.volume >= 0.0
            && self.window_end_ms > self.window_start_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn trade(price: f64, quantity: f64, ts: i64) -> Trade {
        Trade::new("BTC/USD", price, quantity, ts).unwrap()
    }

    #[test]
    fn trade_accessors() {
        let t = trade(100.5, 0.25, 1_718_617_538_494);
        assert_eq!(t.symbol(), "BTC/USD");
        assert_eq!(t.price(), 100.5);
        assert_eq!(t.quantity(), 0.25);
        assert_eq!(t.timestamp_ms(), 1_718_617_538_494);
    }

    #[test]
    fn trade_rejects_empty_symbol() {
        assert_eq!(Trade::new("  ", 1.0, 1.0, 0), Err(TradeError::EmptySymbol));
    }

    #[test_case(0.0 ; "zero")]
    #[test_case(-1.0 ; "negative")]
    #[test_case(f64::NAN ; "nan")]
    #[test_case(f64::INFINITY ; "infinite")]
    fn trade_rejects_bad_price(price: f64) {
        assert!(matches!(
            Trade::new("ETH/USD", price, 1.0, 0),
            Err(TradeError::InvalidPrice(_))
        ));
    }

    #[test_case(0.0 ; "zero")]
    #[test_case(-0.5 ; "negative")]
    #[test_case(f64::NAN ; "nan")]
    #[test_case(f64::NEG_INFINITY ; "infinite")]
    fn trade_rejects_bad_quantity(quantity: f64) {
        assert!(matches!(
            Trade::new("ETH/USD", 1.0, quantity, 0),
            Err(TradeError::InvalidQuantity(_))
        ));
    }

    #[test_case(MAX_TIMESTAMP_MS, true ; "latest accepted")]
    #[test_case(-MAX_TIMESTAMP_MS, true ; "earliest accepted")]
    #[test_case(MAX_TIMESTAMP_MS + 1, false ; "just past latest")]
    #[test_case(i64::MAX - 1, false ; "near i64 max")]
    #[test_case(i64::MIN, false ; "i64 min")]
    fn trade_timestamp_range(ts: i64, accepted: bool) {
        let result = Trade::new("BTC/USD", 1.0, 1.0, ts);
        if accepted {
            assert!(result.is_ok());
        } else {
            assert_eq!(result, Err(TradeError::TimestampOutOfRange(ts)));
        }
    }

    #[test_case(0, 0 ; "epoch")]
    #[test_case(59_999, 0 ; "last ms of first window")]
    #[test_case(60_000, 60_000 ; "boundary belongs to later window")]
    #[test_case(65_000, 60_000 ; "inside second window")]
    #[test_case(-1, -60_000 ; "pre epoch floors down")]
    fn window_alignment(ts: i64, expected: i64) {
        assert_eq!(align_window_start(ts, 60_000), expected);
    }

    #[test]
    fn window_key_orders_by_start_then_symbol() {
        let a = WindowKey {
            window_start_ms: 0,
            symbol: "ZEC/USD".to_string(),
        };
        let b = WindowKey {
            window_start_ms: 60_000,
            symbol: "BTC/USD".to_string(),
        };
        let c = WindowKey {
            window_start_ms: 60_000,
            symbol: "ETH/USD".to_string(),
        };
        assert!(a < b);
        assert!(b < c);
        assert_eq!(b.to_string(), "BTC/USD@60000");
    }

    #[test]
    fn candle_open_and_apply() {
        let first = trade(100.0, 1.0, 0);
        let key = WindowKey::for_trade(&first, 60_000);
        let mut candle = Candle::open(key, 60_000, &first);

        candle.apply(&trade(105.0, 2.0, 30_000));
        candle.apply(&trade(98.0, 0.5, 45_000));

        assert_eq!(candle.window_start_ms(), 0);
        assert_eq!(candle.window_end_ms(), 60_000);
        assert_eq!(candle.open_price(), 100.0);
        assert_eq!(candle.high(), 105.0);
        assert_eq!(candle.low(), 98.0);
        assert_eq!(candle.close(), 98.0);
        assert_eq!(candle.volume(), 3.5);
        assert_eq!(candle.trade_count(), 3);
        assert!(candle.is_consistent());
    }
}
