//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, pipeline status reporting, and Prometheus metrics.
//! Used by container orchestrators, load balancers, and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (pipeline running, feed connected)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{PipelineState, PipelineStatus, StatusSnapshot};
use crate::infrastructure::kraken::FeedStatus;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Pipeline counters and state.
    pub pipeline: StatusSnapshot,
    /// Live feed status, when the source is the Kraken feed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed: Option<FeedInfo>,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Running with a connected input.
    Healthy,
    /// Starting, draining, or running while the feed reconnects.
    Degraded,
    /// Stopped or failed.
    Unhealthy,
}

/// Live feed status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedInfo {
    /// Whether the feed is subscribed.
    pub connected: bool,
    /// Trades decoded since start.
    pub trades_received: u64,
    /// Current reconnect attempts (0 if connected).
    pub reconnect_attempts: u32,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    pipeline: Arc<PipelineStatus>,
    feed: Option<Arc<FeedStatus>>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        pipeline: Arc<PipelineStatus>,
        feed: Option<Arc<FeedStatus>>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            pipeline,
            feed,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);

    if response.status == HealthStatus::Healthy {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let pipeline = state.pipeline.snapshot();
    let feed = state.feed.as_ref().map(|feed| FeedInfo {
        connected: feed.is_connected(),
        trades_received: feed.trades_received(),
        reconnect_attempts: feed.reconnect_attempts(),
    });

    HealthResponse {
        status: determine_health_status(pipeline.state, feed.as_ref()),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        pipeline,
        feed,
    }
}

fn determine_health_status(state: PipelineState, feed: Option<&FeedInfo>) -> HealthStatus {
    match state {
        PipelineState::Running if feed.is_none_or(|f| f.connected) => HealthStatus::Healthy,
        PipelineState::Running | PipelineState::Starting | PipelineState::Draining => {
            HealthStatus::Degraded
        }
        PipelineState::Stopped | PipelineState::Failed => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(connected: bool) -> FeedInfo {
        FeedInfo {
            connected,
            trades_received: 10,
            reconnect_attempts: u32::from(!connected),
        }
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn running_without_feed_is_healthy() {
        assert_eq!(
            determine_health_status(PipelineState::Running, None),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn running_with_disconnected_feed_is_degraded() {
        assert_eq!(
            determine_health_status(PipelineState::Running, Some(&feed(true))),
            HealthStatus::Healthy
        );
        assert_eq!(
            determine_health_status(PipelineState::Running, Some(&feed(false))),
            HealthStatus::Degraded
        );
    }

    #[test]
    fn transitional_and_terminal_states() {
        assert_eq!(
            determine_health_status(PipelineState::Starting, None),
            HealthStatus::Degraded
        );
        assert_eq!(
            determine_health_status(PipelineState::Draining, None),
            HealthStatus::Degraded
        );
        assert_eq!(
            determine_health_status(PipelineState::Failed, None),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            determine_health_status(PipelineState::Stopped, Some(&feed(true))),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn response_reflects_pipeline_snapshot() {
        let state = HealthServerState::new(
            "0.1.0".to_string(),
            Arc::new(PipelineStatus::new()),
            Some(Arc::new(FeedStatus::new())),
        );
        let response = build_health_response(&state);

        assert_eq!(response.status, HealthStatus::Degraded);
        assert_eq!(response.pipeline.state, PipelineState::Starting);
        assert_eq!(response.feed, Some(FeedInfo {
            connected: false,
            trades_received: 0,
            reconnect_attempts: 0,
        }));

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["pipeline"]["state"], "starting");
    }
}
