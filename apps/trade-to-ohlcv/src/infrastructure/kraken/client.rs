//! Kraken WebSocket Client
//!
//! Connects to Kraken's public v2 stream, subscribes to the `trade` channel
//! and forwards decoded trades over a bounded channel.
//!
//! # Stream URL
//!
//! - Production: `wss://ws.kraken.com/v2`
//!
//! # Connection lifecycle
//!
//! Connect → subscribe → wait for the subscribe ack → stream trades. Any
//! socket error, close frame or idle timeout triggers a reconnect with
//! backoff, after which the subscription is sent again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::messages::{KrakenMessage, SubscribeRequest, parse_frame};
use crate::application::services::{BackoffConfig, BackoffPolicy};
use crate::domain::market::Trade;
use crate::infrastructure::metrics;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in the Kraken client.
#[derive(Debug, thiserror::Error)]
pub enum KrakenClientError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The exchange rejected the subscription.
    #[error("subscription rejected: {0}")]
    SubscriptionRejected(String),

    /// No frame arrived within the idle timeout.
    #[error("no frames received for {0:?}")]
    IdleTimeout(Duration),

    /// Failed to serialize an outbound frame.
    #[error("failed to serialize request: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,
}

// =============================================================================
// Events
// =============================================================================

/// Events emitted by the Kraken client.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Connected and subscribed.
    Connected,
    /// Disconnected from server.
    Disconnected,
    /// Reconnecting to server.
    Reconnecting {
        /// Reconnection attempt number.
        attempt: u32,
    },
    /// Trades decoded from one frame.
    Trades(Vec<Trade>),
    /// Non-fatal error reported by the exchange or the client.
    Error(String),
}

// =============================================================================
// Feed Status
// =============================================================================

/// Connection state shared with the health server.
#[derive(Debug, Default)]
pub struct FeedStatus {
    connected: AtomicBool,
    trades_received: AtomicU64,
    reconnect_attempts: AtomicU32,
}

impl FeedStatus {
    /// Create a disconnected status.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            trades_received: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
        }
    }

    /// Whether the feed is currently subscribed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Trades decoded since start.
    #[must_use]
    pub fn trades_received(&self) -> u64 {
        self.trades_received.load(Ordering::Relaxed)
    }

    /// Reconnect attempts since the last successful subscribe.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Configuration for the Kraken client.
#[derive(Debug, Clone)]
pub struct KrakenClientConfig {
    /// WebSocket URL.
    pub url: String,
    /// Pairs to subscribe to.
    pub symbols: Vec<String>,
    /// Reconnection backoff.
    pub reconnect: BackoffConfig,
    /// Reconnect if no frame arrives for this long (Kraken heartbeats every second).
    pub idle_timeout: Duration,
}

impl KrakenClientConfig {
    /// Create a new configuration with default reconnect settings.
    #[must_use]
    pub fn new(url: impl Into<String>, symbols: Vec<String>) -> Self {
        Self {
            url: url.into(),
            symbols,
            reconnect: BackoffConfig::reconnect(
                Duration::from_millis(500),
                Duration::from_secs(30),
                0,
            ),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// Kraken WebSocket client for public trades.
pub struct KrakenClient {
    config: KrakenClientConfig,
    event_tx: mpsc::Sender<FeedEvent>,
    cancel: CancellationToken,
    status: Arc<FeedStatus>,
}

impl KrakenClient {
    /// Create a new client.
    #[must_use]
    pub fn new(
        config: KrakenClientConfig,
        event_tx: mpsc::Sender<FeedEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            event_tx,
            cancel,
            status: Arc::new(FeedStatus::new()),
        }
    }

    /// Shared connection status.
    #[must_use]
    pub fn status(&self) -> Arc<FeedStatus> {
        Arc::clone(&self.status)
    }

    /// Run the connection loop until cancelled, the event receiver goes
    /// away, or reconnect attempts run out.
    ///
    /// # Errors
    ///
    /// Returns `KrakenClientError::MaxReconnectAttemptsExceeded` once the
    /// reconnect budget is spent.
    pub async fn run(self) -> Result<(), KrakenClientError> {
        let mut reconnect_policy = BackoffPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Kraken client cancelled");
                return Ok(());
            }

            match self.connect_and_run(&mut reconnect_policy).await {
                Ok(()) => {
                    tracing::info!("Kraken client stopped");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Kraken connection error");
                    self.status.connected.store(false, Ordering::Relaxed);
                    if !self.send(FeedEvent::Disconnected).await {
                        return Ok(());
                    }

                    let Some(delay) = reconnect_policy.next_delay() else {
                        let _ = self
                            .event_tx
                            .send(FeedEvent::Error(
                                KrakenClientError::MaxReconnectAttemptsExceeded.to_string(),
                            ))
                            .await;
                        return Err(KrakenClientError::MaxReconnectAttemptsExceeded);
                    };

                    let attempt = reconnect_policy.attempt_count();
                    self.status
                        .reconnect_attempts
                        .store(attempt, Ordering::Relaxed);
                    metrics::record_reconnect();
                    tracing::info!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        "Reconnecting to Kraken"
                    );
                    if !self.send(FeedEvent::Reconnecting { attempt }).await {
                        return Ok(());
                    }

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            tracing::info!("Kraken client cancelled during reconnect delay");
                            return Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Connect, subscribe and stream until error, cancellation or the
    /// receiver hanging up (`Ok`).
    async fn connect_and_run(
        &self,
        reconnect_policy: &mut BackoffPolicy,
    ) -> Result<(), KrakenClientError> {
        tracing::info!(url = %self.config.url, "Connecting to Kraken");

        let (ws_stream, _response) = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            result = tokio_tungstenite::connect_async(&self.config.url) => result?,
        };
        let (mut write, mut read) = ws_stream.split();

        let request = SubscribeRequest::trades(self.config.symbols.clone());
        tracing::info!(symbols = ?self.config.symbols, "Subscribing to trades");
        write.send(Message::Text(request.to_json()?.into())).await?;

        let idle_timeout = self.config.idle_timeout;
        loop {
            let frame = tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                frame = tokio::time::timeout(idle_timeout, read.next()) => frame,
            };

            match frame {
                Err(_) => return Err(KrakenClientError::IdleTimeout(idle_timeout)),
                Ok(Some(Ok(Message::Text(text)))) => {
                    if !self.handle_text(&text, reconnect_policy).await? {
                        return Ok(());
                    }
                }
                Ok(Some(Ok(Message::Ping(data)))) => {
                    write.send(Message::Pong(data)).await?;
                }
                Ok(Some(Ok(Message::Close(_)))) => {
                    tracing::info!("Server sent close frame");
                    return Err(KrakenClientError::ConnectionClosed);
                }
                Ok(Some(Ok(_))) => {
                    // Ignore binary and pong frames
                }
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => {
                    tracing::info!("WebSocket stream ended");
                    return Err(KrakenClientError::ConnectionClosed);
                }
            }
        }
    }

    /// Handle one text frame. Returns `false` once the receiver is gone.
    async fn handle_text(
        &self,
        text: &str,
        reconnect_policy: &mut BackoffPolicy,
    ) -> Result<bool, KrakenClientError> {
        let message = match parse_frame(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed Kraken frame");
                metrics::record_malformed_record("kraken");
                return Ok(true);
            }
        };

        match message {
            KrakenMessage::Heartbeat | KrakenMessage::Status | KrakenMessage::Other => {
                tracing::trace!("Ignoring control frame");
                Ok(true)
            }
            KrakenMessage::SubscribeAck { success: true, .. } => {
                tracing::info!("Kraken trade subscription confirmed");
                reconnect_policy.reset();
                self.status.connected.store(true, Ordering::Relaxed);
                self.status.reconnect_attempts.store(0, Ordering::Relaxed);
                Ok(self.send(FeedEvent::Connected).await)
            }
            KrakenMessage::SubscribeAck {
                success: false,
                error,
            } => {
                let reason = error.unwrap_or_else(|| "unknown error".to_string());
                tracing::error!(reason = %reason, "Kraken subscription rejected");
                if !self.send(FeedEvent::Error(reason.clone())).await {
                    return Ok(false);
                }
                Err(KrakenClientError::SubscriptionRejected(reason))
            }
            KrakenMessage::Trades(raw) => {
                let trades: Vec<Trade> = raw
                    .iter()
                    .filter_map(|trade| match trade.to_trade() {
                        Ok(trade) => Some(trade),
                        Err(e) => {
                            tracing::warn!(error = %e, symbol = %trade.symbol, "Skipping invalid trade");
                            metrics::record_malformed_record("kraken");
                            None
                        }
                    })
                    .collect();

                if trades.is_empty() {
                    return Ok(true);
                }
                self.status
                    .trades_received
                    .fetch_add(trades.len() as u64, Ordering::Relaxed);
                Ok(self.send(FeedEvent::Trades(trades)).await)
            }
        }
    }

    async fn send(&self, event: FeedEvent) -> bool {
        if self.event_tx.send(event).await.is_err() {
            tracing::debug!("Feed event receiver dropped");
            return false;
        }
        true
    }
}
