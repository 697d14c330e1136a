//! Tumbling Window Aggregation
//!
//! Keyed, watermark-driven reduction of trades into OHLCV candles.
//!
//! # Finalization
//!
//! The aggregator tracks the highest event time seen so far (the watermark
//! `W`). After every trade, each in-flight candle whose window end is at or
//! before `W - late_tolerance_ms` is finalized, removed and returned to the
//! caller. Because `W` never decreases, a window that has been evicted can
//! never be reopened: any later trade mapping to it is counted as late and
//! dropped.
//!
//! # Ownership
//!
//! The aggregator exclusively owns its in-flight candles. Callers only ever
//! receive finalized candles, moved out of the map.
//!
//! `apply` and `flush` are synchronous and never block.

use std::collections::BTreeMap;

use crate::domain::market::{Candle, Trade, WindowKey, align_window_start};

/// Longest accepted window (366 days).
pub const MAX_WINDOW_DURATION_MS: i64 = 366 * 24 * 60 * 60 * 1_000;

// =============================================================================
// Configuration
// =============================================================================

/// Invalid window configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowConfigError {
    /// Window duration must be positive.
    #[error("window duration must be positive, got {0}ms")]
    NonPositiveDuration(i64),

    /// Window duration above `MAX_WINDOW_DURATION_MS`.
    #[error("window duration cannot exceed {max}ms, got {0}ms", max = MAX_WINDOW_DURATION_MS)]
    DurationTooLarge(i64),

    /// Late tolerance must not be negative.
    #[error("late tolerance cannot be negative, got {0}ms")]
    NegativeTolerance(i64),
}

/// Window sizing and grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    window_duration_ms: i64,
    late_tolerance_ms: i64,
}

impl WindowConfig {
    /// Create a validated window configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the duration is not positive or above
    /// `MAX_WINDOW_DURATION_MS`, or the tolerance is negative.
    pub const fn new(
        window_duration_ms: i64,
        late_tolerance_ms: i64,
    ) -> Result<Self, WindowConfigError> {
        if window_duration_ms <= 0 {
            return Err(WindowConfigError::NonPositiveDuration(window_duration_ms));
        }
        if window_duration_ms > MAX_WINDOW_DURATION_MS {
            return Err(WindowConfigError::DurationTooLarge(window_duration_ms));
        }
        if late_tolerance_ms < 0 {
            return Err(WindowConfigError::NegativeTolerance(late_tolerance_ms));
        }
        Ok(Self {
            window_duration_ms,
            late_tolerance_ms,
        })
    }

    /// Configuration with a grace period of one window duration.
    ///
    /// # Errors
    ///
    /// Returns an error if the duration is not positive.
    pub const fn with_default_tolerance(
        window_duration_ms: i64,
    ) -> Result<Self, WindowConfigError> {
        Self::new(window_duration_ms, window_duration_ms)
    }

    /// Size of each tumbling window.
    #[must_use]
    pub const fn window_duration_ms(&self) -> i64 {
        self.window_duration_ms
    }

    /// Grace period after a window's nominal end.
    #[must_use]
    pub const fn late_tolerance_ms(&self) -> i64 {
        self.late_tolerance_ms
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Running counters for one aggregator instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    /// Trades folded into a candle.
    pub trades_applied: u64,
    /// Trades dropped because their window was already closed.
    pub late_trades: u64,
    /// Candles created.
    pub windows_opened: u64,
    /// Candles finalized (evicted or flushed).
    pub windows_finalized: u64,
    /// Highest event time observed, if any trade has been seen.
    pub watermark: Option<i64>,
    /// Candles currently in flight.
    pub in_flight: usize,
}

// =============================================================================
// Aggregator
// =============================================================================

/// Watermark-based tumbling window aggregator.
#[derive(Debug)]
pub struct WindowAggregator {
    config: WindowConfig,
    in_flight: BTreeMap<WindowKey, Candle>,
    watermark: Option<i64>,
    stats: AggregatorStats,
}

impl WindowAggregator {
    /// Create an empty aggregator.
    #[must_use]
    pub const fn new(config: WindowConfig) -> Self {
        Self {
            config,
            in_flight: BTreeMap::new(),
            watermark: None,
            stats: AggregatorStats {
                trades_applied: 0,
                late_trades: 0,
                windows_opened: 0,
                windows_finalized: 0,
                watermark: None,
                in_flight: 0,
            },
        }
    }

    /// Window configuration in use.
    #[must_use]
    pub const fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Highest event time observed so far.
    #[must_use]
    pub const fn watermark(&self) -> Option<i64> {
        self.watermark
    }

    /// Number of candles currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of late trades dropped so far.
    #[must_use]
    pub const fn late_trades(&self) -> u64 {
        self.stats.late_trades
    }

    /// Snapshot of the running counters.
    #[must_use]
    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            watermark: self.watermark,
            in_flight: self.in_flight.len(),
            ..self.stats
        }
    }

    /// Whether a trade with this timestamp maps to an already-closed window.
    #[must_use]
    pub fn is_late(&self, timestamp_ms: i64) -> bool {
        let Some(horizon) = self.eviction_horizon() else {
            return false;
        };
        let window_end =
            align_window_start(timestamp_ms, self.config.window_duration_ms)
                .saturating_add(self.config.window_duration_ms);
        window_end <= horizon
    }

    /// Apply one trade and return every candle that closed as a result.
    ///
    /// The returned candles are ordered by increasing window start. A late
    /// trade is counted and dropped; it never reopens a finalized window.
    pub fn apply(&mut self, trade: Trade) -> Vec<Candle> {
        if self.is_late(trade.timestamp_ms()) {
            self.stats.late_trades += 1;
            tracing::debug!(
                symbol = trade.symbol(),
                timestamp_ms = trade.timestamp_ms(),
                watermark = ?self.watermark,
                "Dropping late trade"
            );
            return Vec::new();
        }

        let key = WindowKey::for_trade(&trade, self.config.window_duration_ms);
        if let Some(candle) = self.in_flight.get_mut(&key) {
            candle.apply(&trade);
        } else {
            let candle = Candle::open(key.clone(), self.config.window_duration_ms, &trade);
            self.in_flight.insert(key, candle);
            self.stats.windows_opened += 1;
        }
        self.stats.trades_applied += 1;

        self.advance_watermark(trade.timestamp_ms());
        self.evict_closed()
    }

    /// Finalize every in-flight candle, oldest window first.
    pub fn flush(&mut self) -> Vec<Candle> {
        let finalized: Vec<Candle> = std::mem::take(&mut self.in_flight).into_values().collect();
        self.stats.windows_finalized += finalized.len() as u64;
        finalized
    }

    fn advance_watermark(&mut self, timestamp_ms: i64) {
        self.watermark = Some(self.watermark.map_or(timestamp_ms, |w| w.max(timestamp_ms)));
    }

    fn eviction_horizon(&self) -> Option<i64> {
        self.watermark
            .map(|w| w.saturating_sub(self.config.late_tolerance_ms))
    }

    fn evict_closed(&mut self) -> Vec<Candle> {
        let Some(horizon) = self.eviction_horizon() else {
            return Vec::new();
        };

        let mut finalized = Vec::new();
        // Keys are ordered by window start, so every closed window sits at the front.
        while let Some(entry) = self.in_flight.first_entry() {
            if entry.get().window_end_ms() > horizon {
                break;
            }
            finalized.push(entry.remove());
        }
        self.stats.windows_finalized += finalized.len() as u64;
        finalized
    }
}
