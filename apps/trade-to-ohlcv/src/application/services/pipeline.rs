//! Pipeline Driver
//!
//! Runs the ingest → aggregate → emit loop for one pipeline instance.
//!
//! # Lifecycle
//!
//! ```text
//! STARTING ──► RUNNING ──► DRAINING ──► STOPPED
//!     │           │            │
//!     └───────────┴────────────┴──────► FAILED
//! ```
//!
//! - `STARTING`: connect source and sink, bounded by a startup timeout.
//! - `RUNNING`: poll the source with a bounded timeout, apply each trade,
//!   emit finalized candles, then acknowledge progress. Cancellation is
//!   checked between polls, never mid-update.
//! - `DRAINING`: flush the aggregator, emit everything, acknowledge the last
//!   processed position, close the sink. Bounded by the drain timeout.
//! - `FAILED`: terminal; entered on startup failure, source failure, drain
//!   timeout or an emission that exhausted its retries.
//!
//! # Acknowledgement
//!
//! A position is only acknowledged once every trade at or below it is
//! reflected in an emitted candle. Each in-flight window remembers the last
//! position processed before its first trade; the oldest such window caps
//! what may be committed. A restart after a failure or crash therefore
//! re-delivers every trade of every unemitted window (at-least-once).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::backoff::{BackoffConfig, BackoffPolicy};
use crate::application::ports::{
    CandleSink, EmitError, SourceError, SourcePoll, SourcePosition, SourceRecord, TradeSource,
};
use crate::domain::market::{Candle, WindowKey};
use crate::domain::window::{WindowAggregator, WindowConfig};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Driver settings for one pipeline run.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Window sizing and grace period.
    pub window: WindowConfig,
    /// Symbols to aggregate (empty = all).
    pub symbols: Vec<String>,
    /// Upper bound for a single source poll.
    pub poll_timeout: Duration,
    /// Acknowledge every N processed positions (minimum 1).
    pub commit_interval: u32,
    /// Upper bound for connecting source and sink.
    pub startup_timeout: Duration,
    /// Retry policy for transient emission failures.
    pub emit_retry: BackoffConfig,
    /// Upper bound for flushing, emitting and committing while draining.
    pub drain_timeout: Duration,
}

impl DriverConfig {
    /// Defaults around the given window configuration.
    #[must_use]
    pub fn new(window: WindowConfig) -> Self {
        Self {
            window,
            symbols: Vec::new(),
            poll_timeout: Duration::from_millis(500),
            commit_interval: 1,
            startup_timeout: Duration::from_secs(10),
            emit_retry: BackoffConfig::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// State
// =============================================================================

/// Pipeline lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PipelineState {
    /// Connecting adapters.
    Starting = 0,
    /// Processing trades.
    Running = 1,
    /// Flushing in-flight candles.
    Draining = 2,
    /// Cleanly stopped.
    Stopped = 3,
    /// Halted on a fatal error.
    Failed = 4,
}

impl PipelineState {
    /// State name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    /// Whether the pipeline has finished, successfully or not.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Draining,
            3 => Self::Stopped,
            _ => Self::Failed,
        }
    }
}

const NO_WATERMARK: i64 = i64::MIN;

/// Lock-free view of a running pipeline, shared with the health server.
#[derive(Debug)]
pub struct PipelineStatus {
    state: AtomicU8,
    trades_received: AtomicU64,
    late_trades: AtomicU64,
    filtered_trades: AtomicU64,
    candles_emitted: AtomicU64,
    emit_retries: AtomicU64,
    committed_position: AtomicU64,
    watermark: AtomicI64,
    in_flight: AtomicUsize,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineStatus {
    /// Fresh status in the `Starting` state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(PipelineState::Starting as u8),
            trades_received: AtomicU64::new(0),
            late_trades: AtomicU64::new(0),
            filtered_trades: AtomicU64::new(0),
            candles_emitted: AtomicU64::new(0),
            emit_retries: AtomicU64::new(0),
            committed_position: AtomicU64::new(0),
            watermark: AtomicI64::new(NO_WATERMARK),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: PipelineState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        let watermark = self.watermark.load(Ordering::Relaxed);
        let committed = self.committed_position.load(Ordering::Relaxed);
        StatusSnapshot {
            state: self.state(),
            trades_received: self.trades_received.load(Ordering::Relaxed),
            late_trades: self.late_trades.load(Ordering::Relaxed),
            filtered_trades: self.filtered_trades.load(Ordering::Relaxed),
            candles_emitted: self.candles_emitted.load(Ordering::Relaxed),
            emit_retries: self.emit_retries.load(Ordering::Relaxed),
            committed_position: (committed > 0).then_some(committed),
            watermark_ms: (watermark != NO_WATERMARK).then_some(watermark),
            in_flight_windows: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`PipelineStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// Lifecycle state.
    pub state: PipelineState,
    /// Records pulled from the source.
    pub trades_received: u64,
    /// Trades dropped as late.
    pub late_trades: u64,
    /// Trades skipped by the symbol filter.
    pub filtered_trades: u64,
    /// Candles handed to the sink.
    pub candles_emitted: u64,
    /// Emission retries after transient failures.
    pub emit_retries: u64,
    /// Last acknowledged source position.
    pub committed_position: Option<u64>,
    /// Aggregator watermark.
    pub watermark_ms: Option<i64>,
    /// Candles still in flight.
    pub in_flight_windows: usize,
}

// =============================================================================
// Errors & Summary
// =============================================================================

/// Fatal pipeline failures.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// An adapter failed to connect.
    #[error("startup failed for {component}: {message}")]
    Startup {
        /// Which adapter failed.
        component: &'static str,
        /// Underlying failure.
        message: String,
    },

    /// Adapters did not connect in time.
    #[error("startup timed out after {0:?}")]
    StartupTimeout(Duration),

    /// The source failed while polling or acknowledging.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Transient emission failures outlasted the retry budget.
    #[error("emitting candle {window} failed after {attempts} attempts: {last_error}")]
    EmitRetriesExhausted {
        /// Window of the candle that could not be emitted.
        window: WindowKey,
        /// Total emission attempts.
        attempts: u32,
        /// Last failure reported by the sink.
        last_error: EmitError,
    },

    /// The sink permanently rejected a candle.
    #[error("candle {window} rejected by sink: {error}")]
    EmitRejected {
        /// Window of the rejected candle.
        window: WindowKey,
        /// Rejection reported by the sink.
        error: EmitError,
    },

    /// Draining did not finish in time.
    #[error("drain timed out after {0:?}")]
    DrainTimeout(Duration),

    /// The sink failed to flush on shutdown.
    #[error("sink close failed: {0}")]
    SinkClose(EmitError),
}

/// Outcome of a clean run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Identifier attached to this run's logs.
    pub run_id: Uuid,
    /// Records pulled from the source.
    pub trades_received: u64,
    /// Trades dropped as late.
    pub late_trades: u64,
    /// Trades skipped by the symbol filter.
    pub filtered_trades: u64,
    /// Candles handed to the sink.
    pub candles_emitted: u64,
    /// Last acknowledged source position.
    pub last_committed: Option<SourcePosition>,
}

// =============================================================================
// Driver
// =============================================================================

/// Where an in-flight window's input began.
#[derive(Debug, Clone, Copy)]
struct WindowOrigin {
    /// Position of the window's first trade.
    first: SourcePosition,
    /// Last position processed before that trade.
    committable: Option<SourcePosition>,
}

/// Sequential ingest → aggregate → emit loop.
pub struct PipelineDriver<S, K> {
    config: DriverConfig,
    source: S,
    sink: K,
    aggregator: WindowAggregator,
    symbols: HashSet<String>,
    status: Arc<PipelineStatus>,
    cancel: CancellationToken,
    run_id: Uuid,
    window_origins: HashMap<WindowKey, WindowOrigin>,
    latest: Option<SourcePosition>,
    uncommitted: u32,
    last_committed: Option<SourcePosition>,
}

impl<S: TradeSource, K: CandleSink> PipelineDriver<S, K> {
    /// Create a driver that owns its source, sink and aggregator.
    #[must_use]
    pub fn new(config: DriverConfig, source: S, sink: K, cancel: CancellationToken) -> Self {
        let aggregator = WindowAggregator::new(config.window);
        let symbols = config.symbols.iter().cloned().collect();
        Self {
            config,
            source,
            sink,
            aggregator,
            symbols,
            status: Arc::new(PipelineStatus::new()),
            cancel,
            run_id: Uuid::new_v4(),
            window_origins: HashMap::new(),
            latest: None,
            uncommitted: 0,
            last_committed: None,
        }
    }

    /// Shared status handle for health reporting.
    #[must_use]
    pub fn status(&self) -> Arc<PipelineStatus> {
        Arc::clone(&self.status)
    }

    /// Run until cancelled, the source is exhausted, or a fatal error.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError` when the pipeline halts in the `Failed` state.
    pub async fn run(mut self) -> Result<RunSummary, PipelineError> {
        let span = tracing::info_span!("pipeline", run_id = %self.run_id);
        self.run_lifecycle().instrument(span).await
    }

    async fn run_lifecycle(&mut self) -> Result<RunSummary, PipelineError> {
        self.transition(PipelineState::Starting);
        if let Err(error) = self.start().await {
            return Err(self.fail(error));
        }

        self.transition(PipelineState::Running);
        if let Err(error) = self.pump().await {
            return Err(self.fail(error));
        }

        self.transition(PipelineState::Draining);
        let drain_timeout = self.config.drain_timeout;
        let drained = tokio::time::timeout(drain_timeout, self.drain())
            .await
            .unwrap_or(Err(PipelineError::DrainTimeout(drain_timeout)));
        if let Err(error) = drained {
            return Err(self.fail(error));
        }

        self.transition(PipelineState::Stopped);
        let summary = self.summary();
        tracing::info!(
            trades = summary.trades_received,
            late = summary.late_trades,
            candles = summary.candles_emitted,
            committed = ?summary.last_committed,
            "Pipeline stopped"
        );
        Ok(summary)
    }

    async fn start(&mut self) -> Result<(), PipelineError> {
        let timeout = self.config.startup_timeout;
        let source = &mut self.source;
        let sink = &mut self.sink;

        let connect = async move {
            source
                .connect()
                .await
                .map_err(|e| PipelineError::Startup {
                    component: "source",
                    message: e.to_string(),
                })?;
            sink.connect().await.map_err(|e| PipelineError::Startup {
                component: "sink",
                message: e.to_string(),
            })
        };

        tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| PipelineError::StartupTimeout(timeout))?
    }

    async fn pump(&mut self) -> Result<(), PipelineError> {
        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Cancellation requested");
                return Ok(());
            }

            match self.source.next(self.config.poll_timeout).await? {
                SourcePoll::Record(record) => self.process(record).await?,
                SourcePoll::NoData => {
                    tracing::trace!("No data before poll timeout");
                }
                SourcePoll::Exhausted => {
                    tracing::info!("Source exhausted");
                    return Ok(());
                }
            }
        }
    }

    async fn process(&mut self, record: SourceRecord) -> Result<(), PipelineError> {
        let SourceRecord { trade, position } = record;
        self.status.trades_received.fetch_add(1, Ordering::Relaxed);
        metrics::record_trade_received();

        if !self.symbols.is_empty() && !self.symbols.contains(trade.symbol()) {
            self.status.filtered_trades.fetch_add(1, Ordering::Relaxed);
            metrics::record_filtered_trade();
            return self.mark_processed(position).await;
        }

        let key = WindowKey::for_trade(&trade, self.config.window.window_duration_ms());
        let late_before = self.aggregator.late_trades();
        let finalized = self.aggregator.apply(trade);
        if self.aggregator.late_trades() > late_before {
            self.status.late_trades.fetch_add(1, Ordering::Relaxed);
            metrics::record_late_trade();
        } else {
            let committable = self.latest;
            self.window_origins.entry(key).or_insert(WindowOrigin {
                first: position,
                committable,
            });
        }

        for candle in &finalized {
            self.emit_with_retry(candle).await?;
        }
        self.publish_window_state();

        self.mark_processed(position).await
    }

    async fn drain(&mut self) -> Result<(), PipelineError> {
        let remaining = self.aggregator.flush();
        tracing::info!(candles = remaining.len(), "Flushing in-flight candles");

        for candle in &remaining {
            self.emit_with_retry(candle).await?;
        }
        self.publish_window_state();

        self.commit().await?;
        self.sink.close().await.map_err(PipelineError::SinkClose)
    }

    async fn emit_with_retry(&mut self, candle: &Candle) -> Result<(), PipelineError> {
        let mut policy = BackoffPolicy::new(self.config.emit_retry.clone());

        loop {
            let started = Instant::now();
            match self.sink.emit(candle).await {
                Ok(()) => {
                    self.window_origins.remove(&candle.key());
                    self.status.candles_emitted.fetch_add(1, Ordering::Relaxed);
                    metrics::record_candle_emitted(started.elapsed());
                    tracing::debug!(
                        window = %candle.key(),
                        open = candle.open_price(),
                        high = candle.high(),
                        low = candle.low(),
                        close = candle.close(),
                        volume = candle.volume(),
                        trades = candle.trade_count(),
                        "Candle emitted"
                    );
                    return Ok(());
                }
                Err(error) if error.is_retryable() => {
                    let Some(delay) = policy.next_delay() else {
                        metrics::record_emit_failure("exhausted");
                        return Err(PipelineError::EmitRetriesExhausted {
                            window: candle.key(),
                            attempts: policy.attempt_count() + 1,
                            last_error: error,
                        });
                    };

                    self.status.emit_retries.fetch_add(1, Ordering::Relaxed);
                    metrics::record_emit_retry();
                    tracing::warn!(
                        window = %candle.key(),
                        attempt = policy.attempt_count(),
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "Transient emit failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    metrics::record_emit_failure("rejected");
                    return Err(PipelineError::EmitRejected {
                        window: candle.key(),
                        error,
                    });
                }
            }
        }
    }

    async fn mark_processed(&mut self, position: SourcePosition) -> Result<(), PipelineError> {
        self.latest = Some(position);
        self.uncommitted += 1;
        if self.uncommitted >= self.config.commit_interval.max(1) {
            self.commit().await?;
        }
        Ok(())
    }

    /// Highest position whose trades are all reflected in emitted candles.
    fn committable(&self) -> Option<SourcePosition> {
        self.window_origins
            .values()
            .min_by_key(|origin| origin.first)
            .map_or(self.latest, |origin| origin.committable)
    }

    async fn commit(&mut self) -> Result<(), PipelineError> {
        let Some(position) = self.committable() else {
            return Ok(());
        };
        if self.last_committed >= Some(position) {
            return Ok(());
        }

        self.source.ack(position).await?;
        self.uncommitted = 0;
        self.last_committed = Some(position);
        self.status
            .committed_position
            .store(position.value(), Ordering::Relaxed);
        metrics::set_committed_position(position.value());
        tracing::trace!(%position, "Position acknowledged");
        Ok(())
    }

    fn publish_window_state(&self) {
        let in_flight = self.aggregator.in_flight();
        self.status.in_flight.store(in_flight, Ordering::Relaxed);
        metrics::set_in_flight_windows(in_flight);
        if let Some(watermark) = self.aggregator.watermark() {
            self.status.watermark.store(watermark, Ordering::Relaxed);
            metrics::set_watermark(watermark);
        }
    }

    fn transition(&self, state: PipelineState) {
        self.status.set_state(state);
        metrics::set_pipeline_state(state);
        tracing::info!(state = state.as_str(), "Pipeline state changed");
    }

    fn fail(&self, error: PipelineError) -> PipelineError {
        self.transition(PipelineState::Failed);
        tracing::error!(
            error = %error,
            committed = ?self.last_committed,
            processed = ?self.latest,
            "Pipeline failed"
        );
        error
    }

    fn summary(&self) -> RunSummary {
        let snapshot = self.status.snapshot();
        RunSummary {
            run_id: self.run_id,
            trades_received: snapshot.trades_received,
            late_trades: snapshot.late_trades,
            filtered_trades: snapshot.filtered_trades,
            candles_emitted: snapshot.candles_emitted,
            last_committed: self.last_committed,
        }
    }
}
