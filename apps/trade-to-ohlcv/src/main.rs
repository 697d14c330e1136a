//! Trade to OHLCV Binary
//!
//! Starts the candle aggregation pipeline.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin trade-to-ohlcv
//! OHLCV_SOURCE=file OHLCV_INPUT_PATH=trades.jsonl cargo run --bin trade-to-ohlcv
//! ```
//!
//! # Environment Variables
//!
//! - `OHLCV_WINDOW_DURATION_MS`: Window size (default: 60000)
//! - `OHLCV_LATE_TOLERANCE_MS`: Grace period (default: window size)
//! - `OHLCV_SYMBOLS`: Comma-separated pairs (default: BTC/USD)
//! - `OHLCV_SOURCE`: kraken | stdin | file (default: kraken)
//! - `OHLCV_INPUT_PATH`, `OHLCV_CHECKPOINT_PATH`: input file and checkpoint
//! - `OHLCV_SINK`: stdout | file (default: stdout)
//! - `OHLCV_OUTPUT_PATH`: output file for the file sink
//! - `KRAKEN_WS_URL`: Feed endpoint (default: <wss://ws.kraken.com/v2>)
//! - `OHLCV_SHUTDOWN_TIMEOUT_SECS`: Drain bound on shutdown (default: 30)
//! - `OHLCV_HEALTH_PORT`: Health check HTTP port, 0 disables (default: 8083)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use trade_to_ohlcv::infrastructure::health::{HealthServer, HealthServerState};
use trade_to_ohlcv::infrastructure::kraken::{FeedStatus, KrakenClient, KrakenClientConfig};
use trade_to_ohlcv::infrastructure::sink::JsonLinesSink;
use trade_to_ohlcv::infrastructure::source::{Checkpoint, FeedSource, JsonLinesSource};
use trade_to_ohlcv::infrastructure::telemetry;
use trade_to_ohlcv::{
    CandleSink, PipelineConfig, PipelineDriver, PipelineError, RunSummary, SinkKind, SourceKind,
    TradeSource, init_metrics,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| "failed to install rustls crypto provider")?;

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Trade to OHLCV");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder not installed");
    }

    let config = PipelineConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();
    tokio::spawn(await_shutdown(
        shutdown_token.clone(),
        config.driver.drain_timeout,
    ));

    let result = match config.source.kind {
        SourceKind::Kraken => {
            let (event_tx, event_rx) = mpsc::channel(config.feed.event_capacity);
            let mut client_config =
                KrakenClientConfig::new(config.feed.url.clone(), config.driver.symbols.clone());
            client_config.reconnect = config.feed.reconnect_backoff();
            let client = KrakenClient::new(client_config, event_tx, shutdown_token.clone());
            let feed_status = client.status();

            tokio::spawn(async move {
                if let Err(e) = client.run().await {
                    tracing::error!(error = %e, "Kraken client error");
                }
            });

            let source = FeedSource::new(event_rx, shutdown_token.clone());
            run_with_sink(&config, source, Some(feed_status), &shutdown_token).await
        }
        SourceKind::Stdin => {
            let mut source = JsonLinesSource::stdin();
            if let Some(path) = &config.source.checkpoint_path {
                source = source.with_checkpoint(Checkpoint::new(path));
            }
            run_with_sink(&config, source, None, &shutdown_token).await
        }
        SourceKind::File => {
            let path = config
                .source
                .input_path
                .as_ref()
                .ok_or("OHLCV_INPUT_PATH is required for the file source")?;
            let mut source = JsonLinesSource::open(path).await?;
            if let Some(checkpoint) = &config.source.checkpoint_path {
                source = source.with_checkpoint(Checkpoint::new(checkpoint));
            }
            run_with_sink(&config, source, None, &shutdown_token).await
        }
    };

    // Stop the feed client and health server whether or not the driver failed.
    shutdown_token.cancel();

    match result {
        Ok(summary) => {
            tracing::info!(
                run_id = %summary.run_id,
                trades = summary.trades_received,
                candles = summary.candles_emitted,
                "Trade to OHLCV stopped"
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "Trade to OHLCV failed");
            Err(e.into())
        }
    }
}

/// Pick the configured sink and run the pipeline.
async fn run_with_sink<S: TradeSource>(
    config: &PipelineConfig,
    source: S,
    feed_status: Option<Arc<FeedStatus>>,
    shutdown_token: &CancellationToken,
) -> Result<RunSummary, PipelineError> {
    match config.sink.kind {
        SinkKind::Stdout => {
            run_pipeline(
                config,
                source,
                JsonLinesSink::stdout(),
                feed_status,
                shutdown_token,
            )
            .await
        }
        SinkKind::File => {
            let Some(path) = &config.sink.output_path else {
                return Err(PipelineError::Startup {
                    component: "sink",
                    message: "OHLCV_OUTPUT_PATH is required for the file sink".to_string(),
                });
            };
            let sink = JsonLinesSink::append(path)
                .await
                .map_err(|e| PipelineError::Startup {
                    component: "sink",
                    message: format!("{}: {e}", path.display()),
                })?;
            run_pipeline(config, source, sink, feed_status, shutdown_token).await
        }
    }
}

/// Wire the driver to the health server and run it to completion.
async fn run_pipeline<S: TradeSource, K: CandleSink>(
    config: &PipelineConfig,
    source: S,
    sink: K,
    feed_status: Option<Arc<FeedStatus>>,
    shutdown_token: &CancellationToken,
) -> Result<RunSummary, PipelineError> {
    let driver = PipelineDriver::new(
        config.driver.clone(),
        source,
        sink,
        shutdown_token.clone(),
    );

    if config.server.health_port != 0 {
        let health_state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            driver.status(),
            feed_status,
        ));
        let health_server = HealthServer::new(
            config.server.health_port,
            health_state,
            shutdown_token.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = health_server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        });
    }

    tracing::info!("Pipeline ready");
    driver.run().await
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &PipelineConfig) {
    let window = config.driver.window;
    tracing::info!(
        window_duration_ms = window.window_duration_ms(),
        late_tolerance_ms = window.late_tolerance_ms(),
        symbols = ?config.driver.symbols,
        source = config.source.kind.as_str(),
        sink = config.sink.kind.as_str(),
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        poll_timeout_ms = config.driver.poll_timeout.as_millis(),
        commit_interval = config.driver.commit_interval,
        emit_max_attempts = config.driver.emit_retry.max_attempts,
        drain_timeout_secs = config.driver.drain_timeout.as_secs(),
        kraken_url = %config.feed.url,
        "Pipeline tuning"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken, drain_timeout: Duration) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
        () = shutdown_token.cancelled() => return,
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = drain_timeout.as_secs(),
        "Graceful shutdown started, draining in-flight candles"
    );
}
