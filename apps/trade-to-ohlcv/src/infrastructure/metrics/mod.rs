//! Prometheus Metrics Module
//!
//! Exposes aggregator metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Trades**: received, late, filtered and malformed inputs
//! - **Candles**: emissions, retries and failures
//! - **Progress**: watermark, in-flight windows, committed position, state
//! - **Feed**: reconnection attempts
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::application::services::PipelineState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Later calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns `BuildError` if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Trade counters
    describe_counter!(
        "ohlcv_trades_received_total",
        "Total trades pulled from the source"
    );
    describe_counter!(
        "ohlcv_trades_late_total",
        "Total trades dropped because their window had already closed"
    );
    describe_counter!(
        "ohlcv_trades_filtered_total",
        "Total trades skipped by the symbol filter"
    );
    describe_counter!(
        "ohlcv_records_malformed_total",
        "Total input records skipped because they could not be decoded"
    );

    // Candle counters
    describe_counter!(
        "ohlcv_candles_emitted_total",
        "Total finalized candles handed to the sink"
    );
    describe_counter!(
        "ohlcv_emit_retries_total",
        "Total emission retries after transient sink failures"
    );
    describe_counter!(
        "ohlcv_emit_failures_total",
        "Total fatal emission failures by reason"
    );

    // Progress gauges
    describe_gauge!("ohlcv_watermark_ms", "Highest event time applied");
    describe_gauge!("ohlcv_in_flight_windows", "Candles not yet finalized");
    describe_gauge!(
        "ohlcv_committed_position",
        "Last source position acknowledged"
    );
    describe_gauge!(
        "ohlcv_pipeline_state",
        "Pipeline lifecycle state (0=starting 1=running 2=draining 3=stopped 4=failed)"
    );

    // Feed counters
    describe_counter!(
        "ohlcv_feed_reconnects_total",
        "Total trade feed reconnection attempts"
    );

    // Latency histograms
    describe_histogram!(
        "ohlcv_emit_duration_seconds",
        "Time for the sink to accept one candle"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a trade pulled from the source.
pub fn record_trade_received() {
    counter!("ohlcv_trades_received_total").increment(1);
}

/// Record a trade dropped as late.
pub fn record_late_trade() {
    counter!("ohlcv_trades_late_total").increment(1);
}

/// Record a trade skipped by the symbol filter.
pub fn record_filtered_trade() {
    counter!("ohlcv_trades_filtered_total").increment(1);
}

/// Record an undecodable input record.
pub fn record_malformed_record(source: &'static str) {
    counter!("ohlcv_records_malformed_total", "source" => source).increment(1);
}

/// Record a successful candle emission.
pub fn record_candle_emitted(duration: Duration) {
    counter!("ohlcv_candles_emitted_total").increment(1);
    histogram!("ohlcv_emit_duration_seconds").record(duration.as_secs_f64());
}

/// Record an emission retry.
pub fn record_emit_retry() {
    counter!("ohlcv_emit_retries_total").increment(1);
}

/// Record a fatal emission failure (`exhausted` or `rejected`).
pub fn record_emit_failure(reason: &'static str) {
    counter!("ohlcv_emit_failures_total", "reason" => reason).increment(1);
}

/// Record a feed reconnection attempt.
pub fn record_reconnect() {
    counter!("ohlcv_feed_reconnects_total").increment(1);
}

/// Update the watermark gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_watermark(watermark_ms: i64) {
    gauge!("ohlcv_watermark_ms").set(watermark_ms as f64);
}

/// Update the in-flight window gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_in_flight_windows(count: usize) {
    gauge!("ohlcv_in_flight_windows").set(count as f64);
}

/// Update the committed position gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_committed_position(position: u64) {
    gauge!("ohlcv_committed_position").set(position as f64);
}

/// Update the pipeline state gauge.
pub fn set_pipeline_state(state: PipelineState) {
    gauge!("ohlcv_pipeline_state").set(f64::from(state as u8));
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        record_trade_received();
        record_malformed_record("stdin");
        record_candle_emitted(Duration::from_millis(3));
        set_pipeline_state(PipelineState::Running);
        set_watermark(1_718_617_538_494);
    }

    #[test]
    fn handle_absent_before_init() {
        // Unit tests never install the global recorder.
        assert!(get_metrics_handle().is_none());
    }
}
