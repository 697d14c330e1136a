//! Pipeline Configuration Settings
//!
//! Configuration types for the aggregator, loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::application::services::{BackoffConfig, DriverConfig};
use crate::domain::window::{WindowConfig, WindowConfigError};

/// Default Kraken v2 public WebSocket endpoint.
pub const DEFAULT_KRAKEN_WS_URL: &str = "wss://ws.kraken.com/v2";

/// Where trades come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceKind {
    /// Live Kraken trade feed.
    #[default]
    Kraken,
    /// JSON lines on standard input.
    Stdin,
    /// JSON lines read from a file.
    File,
}

impl SourceKind {
    /// Parse source kind from string.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unknown kinds.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_lowercase().as_str() {
            "kraken" => Ok(Self::Kraken),
            "stdin" => Ok(Self::Stdin),
            "file" => Ok(Self::File),
            other => Err(ConfigError::InvalidValue {
                key: "OHLCV_SOURCE".to_string(),
                message: format!("unknown source '{other}'"),
            }),
        }
    }

    /// Source name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Kraken => "kraken",
            Self::Stdin => "stdin",
            Self::File => "file",
        }
    }
}

/// Where finalized candles go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SinkKind {
    /// JSON lines on standard output.
    #[default]
    Stdout,
    /// JSON lines appended to a file.
    File,
}

impl SinkKind {
    /// Parse sink kind from string.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unknown kinds.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_lowercase().as_str() {
            "stdout" => Ok(Self::Stdout),
            "file" => Ok(Self::File),
            other => Err(ConfigError::InvalidValue {
                key: "OHLCV_SINK".to_string(),
                message: format!("unknown sink '{other}'"),
            }),
        }
    }

    /// Sink name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::File => "file",
        }
    }
}

/// Input settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSettings {
    /// Source adapter.
    pub kind: SourceKind,
    /// Input file (file source only).
    pub input_path: Option<PathBuf>,
    /// Checkpoint file for replayable sources.
    pub checkpoint_path: Option<PathBuf>,
}

/// Output settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkSettings {
    /// Sink adapter.
    pub kind: SinkKind,
    /// Output file (file sink only).
    pub output_path: Option<PathBuf>,
}

/// Kraken WebSocket settings.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSettings {
    /// WebSocket endpoint.
    pub url: String,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Capacity of the feed event channel.
    pub event_capacity: usize,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_KRAKEN_WS_URL.to_string(),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            max_reconnect_attempts: 0, // Unlimited
            event_capacity: 1_024,
        }
    }
}

impl FeedSettings {
    /// Backoff profile for reconnects.
    #[must_use]
    pub const fn reconnect_backoff(&self) -> BackoffConfig {
        BackoffConfig::reconnect(
            self.reconnect_delay_initial,
            self.reconnect_delay_max,
            self.max_reconnect_attempts,
        )
    }
}

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health check and metrics HTTP port (0 = disabled).
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete aggregator configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Driver settings (window, filter, polling, commits, retries).
    pub driver: DriverConfig,
    /// Input settings.
    pub source: SourceSettings,
    /// Output settings.
    pub sink: SinkSettings,
    /// Kraken feed settings.
    pub feed: FeedSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl PipelineConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the window settings are invalid, an adapter kind
    /// is unknown, or a path required by the chosen adapter is missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        let window_duration_ms = parse_env_i64("OHLCV_WINDOW_DURATION_MS", 60_000);
        let late_tolerance_ms = parse_env_i64("OHLCV_LATE_TOLERANCE_MS", window_duration_ms);
        let window = WindowConfig::new(window_duration_ms, late_tolerance_ms).map_err(|e| {
            let key = match e {
                WindowConfigError::NonPositiveDuration(_)
                | WindowConfigError::DurationTooLarge(_) => "OHLCV_WINDOW_DURATION_MS",
                WindowConfigError::NegativeTolerance(_) => "OHLCV_LATE_TOLERANCE_MS",
            };
            ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }
        })?;

        let symbols = parse_symbols(
            &std::env::var("OHLCV_SYMBOLS").unwrap_or_else(|_| "BTC/USD".to_string()),
        );

        let defaults = BackoffConfig::default();
        let emit_retry = BackoffConfig {
            initial_delay: parse_env_duration_millis(
                "OHLCV_EMIT_RETRY_INITIAL_MS",
                defaults.initial_delay,
            ),
            max_delay: parse_env_duration_millis("OHLCV_EMIT_RETRY_MAX_MS", defaults.max_delay),
            multiplier: parse_env_f64("OHLCV_EMIT_RETRY_MULTIPLIER", defaults.multiplier),
            jitter_factor: defaults.jitter_factor,
            max_attempts: parse_env_u32("OHLCV_EMIT_MAX_ATTEMPTS", defaults.max_attempts),
        };

        let mut driver = DriverConfig::new(window);
        driver.symbols = symbols;
        driver.poll_timeout = parse_env_duration_millis("OHLCV_POLL_TIMEOUT_MS", driver.poll_timeout);
        driver.commit_interval = parse_env_u32("OHLCV_COMMIT_INTERVAL", 1).max(1);
        driver.startup_timeout =
            parse_env_duration_secs("OHLCV_STARTUP_TIMEOUT_SECS", driver.startup_timeout);
        driver.drain_timeout =
            parse_env_duration_secs("OHLCV_SHUTDOWN_TIMEOUT_SECS", driver.drain_timeout);
        driver.emit_retry = emit_retry;

        let source_kind = std::env::var("OHLCV_SOURCE")
            .map_or(Ok(SourceKind::default()), |s| SourceKind::parse(&s))?;
        let source = SourceSettings {
            kind: source_kind,
            input_path: env_path("OHLCV_INPUT_PATH"),
            checkpoint_path: env_path("OHLCV_CHECKPOINT_PATH"),
        };
        if source.kind == SourceKind::File && source.input_path.is_none() {
            return Err(ConfigError::MissingEnvVar("OHLCV_INPUT_PATH".to_string()));
        }

        let sink_kind = std::env::var("OHLCV_SINK")
            .map_or(Ok(SinkKind::default()), |s| SinkKind::parse(&s))?;
        let sink = SinkSettings {
            kind: sink_kind,
            output_path: env_path("OHLCV_OUTPUT_PATH"),
        };
        if sink.kind == SinkKind::File && sink.output_path.is_none() {
            return Err(ConfigError::MissingEnvVar("OHLCV_OUTPUT_PATH".to_string()));
        }

        let feed_defaults = FeedSettings::default();
        let feed = FeedSettings {
            url: std::env::var("KRAKEN_WS_URL").unwrap_or(feed_defaults.url),
            reconnect_delay_initial: parse_env_duration_millis(
                "OHLCV_RECONNECT_DELAY_INITIAL_MS",
                feed_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_env_duration_secs(
                "OHLCV_RECONNECT_DELAY_MAX_SECS",
                feed_defaults.reconnect_delay_max,
            ),
            max_reconnect_attempts: parse_env_u32(
                "OHLCV_MAX_RECONNECT_ATTEMPTS",
                feed_defaults.max_reconnect_attempts,
            ),
            event_capacity: feed_defaults.event_capacity,
        };
        if feed.url.is_empty() {
            return Err(ConfigError::EmptyValue("KRAKEN_WS_URL".to_string()));
        }
        if source.kind == SourceKind::Kraken && driver.symbols.is_empty() {
            return Err(ConfigError::EmptyValue("OHLCV_SYMBOLS".to_string()));
        }

        let server = ServerSettings {
            health_port: parse_env_u16("OHLCV_HEALTH_PORT", ServerSettings::default().health_port),
        };

        Ok(Self {
            driver,
            source,
            sink,
            feed,
            server,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has a value that cannot be used.
    #[error("invalid value for {key}: {message}")]
    InvalidValue {
        /// Offending variable.
        key: String,
        /// What was wrong with it.
        message: String,
    },
}

/// Split a comma-separated symbol list, dropping blanks.
#[must_use]
pub fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kind_parsing() {
        assert_eq!(SourceKind::parse("kraken").unwrap(), SourceKind::Kraken);
        assert_eq!(SourceKind::parse("STDIN").unwrap(), SourceKind::Stdin);
        assert_eq!(SourceKind::parse(" file ").unwrap(), SourceKind::File);
        assert!(matches!(
            SourceKind::parse("kafka"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn sink_kind_parsing() {
        assert_eq!(SinkKind::parse("stdout").unwrap(), SinkKind::Stdout);
        assert_eq!(SinkKind::parse("File").unwrap(), SinkKind::File);
        assert!(SinkKind::parse("feature-store").is_err());
    }

    #[test]
    fn symbol_list_parsing() {
        assert_eq!(
            parse_symbols("BTC/USD, ETH/USD,,  "),
            vec!["BTC/USD".to_string(), "ETH/USD".to_string()]
        );
        assert!(parse_symbols("").is_empty());
    }

    #[test]
    fn feed_settings_defaults() {
        let settings = FeedSettings::default();
        assert_eq!(settings.url, DEFAULT_KRAKEN_WS_URL);
        assert_eq!(settings.reconnect_delay_initial, Duration::from_millis(500));
        assert_eq!(settings.reconnect_delay_max, Duration::from_secs(30));
        assert_eq!(settings.max_reconnect_attempts, 0);

        let backoff = settings.reconnect_backoff();
        assert_eq!(backoff.initial_delay, Duration::from_millis(500));
        assert_eq!(backoff.max_attempts, 0);
    }

    #[test]
    fn server_settings_defaults() {
        assert_eq!(ServerSettings::default().health_port, 8083);
    }

    #[test]
    fn config_error_messages() {
        let error = ConfigError::InvalidValue {
            key: "OHLCV_SINK".to_string(),
            message: "unknown sink 'x'".to_string(),
        };
        assert_eq!(error.to_string(), "invalid value for OHLCV_SINK: unknown sink 'x'");
    }
}
