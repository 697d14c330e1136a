//! Candle Sink Adapters
//!
//! Implementations of the `CandleSink` port.
//!
//! - `JsonLinesSink`: one JSON candle record per line to stdout or a file
//! - `ChannelSink`: hands candles to an in-process consumer over a bounded
//!   channel (e.g. a publisher task)

use std::io::ErrorKind;
use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::application::ports::{CandleSink, EmitError};
use crate::domain::market::Candle;
use crate::infrastructure::codec::encode_candle;

// =============================================================================
// JSON Lines Sink
// =============================================================================

/// Classify an IO failure as retryable or not.
fn classify_io_error(error: &std::io::Error) -> EmitError {
    match error.kind() {
        ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::TimedOut
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted => EmitError::Transient(error.to_string()),
        _ => EmitError::Rejected(error.to_string()),
    }
}

/// `CandleSink` writing newline-delimited JSON candle records.
///
/// A line interrupted by a transient error is kept with its write offset.
/// Retrying the same candle resumes from that offset, so the output never
/// holds a torn or duplicated record.
pub struct JsonLinesSink<W> {
    writer: W,
    pending: Vec<u8>,
    written: usize,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesSink<W> {
    /// Write records to `writer`.
    #[must_use]
    pub const fn new(writer: W) -> Self {
        Self {
            writer,
            pending: Vec::new(),
            written: 0,
        }
    }

    /// Unwrap the underlying writer.
    #[must_use]
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonLinesSink<tokio::io::Stdout> {
    /// Write records to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl JsonLinesSink<tokio::fs::File> {
    /// Append records to a file, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns the IO error if the file cannot be opened.
    pub async fn append(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self::new(file))
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> CandleSink for JsonLinesSink<W> {
    async fn emit(&mut self, candle: &Candle) -> Result<(), EmitError> {
        let mut line = encode_candle(candle).map_err(|e| EmitError::Rejected(e.to_string()))?;
        line.push('\n');

        if self.pending != line.as_bytes() {
            if self.written > 0 && self.written < self.pending.len() {
                // A different record would land after half a line.
                return Err(EmitError::Rejected(format!(
                    "previous record left partially written ({} of {} bytes)",
                    self.written,
                    self.pending.len()
                )));
            }
            self.pending = line.into_bytes();
            self.written = 0;
        }

        while self.written < self.pending.len() {
            let n = self
                .writer
                .write(&self.pending[self.written..])
                .await
                .map_err(|e| classify_io_error(&e))?;
            if n == 0 {
                return Err(EmitError::Rejected("writer accepted zero bytes".to_string()));
            }
            self.written += n;
        }
        self.writer.flush().await.map_err(|e| classify_io_error(&e))?;

        self.pending.clear();
        self.written = 0;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), EmitError> {
        self.writer.flush().await.map_err(|e| classify_io_error(&e))
    }
}

// =============================================================================
// Channel Sink
// =============================================================================

/// `CandleSink` into a bounded channel.
///
/// A full channel is reported as transient so the driver backs off instead
/// of blocking; a closed channel means the consumer is gone for good.
pub struct ChannelSink {
    tx: mpsc::Sender<Candle>,
}

impl ChannelSink {
    /// Send candles to `tx`.
    #[must_use]
    pub const fn new(tx: mpsc::Sender<Candle>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl CandleSink for ChannelSink {
    async fn emit(&mut self, candle: &Candle) -> Result<(), EmitError> {
        self.tx.try_send(candle.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                EmitError::Transient("candle channel full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                EmitError::Rejected("candle channel closed".to_string())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::Trade;
    use crate::domain::window::{WindowAggregator, WindowConfig};
    use test_case::test_case;

    fn candle(symbol: &str) -> Candle {
        let mut aggregator = WindowAggregator::new(WindowConfig::new(60_000, 0).unwrap());
        let _ = aggregator.apply(Trade::new(symbol, 100.0, 1.0, 1_000).unwrap());
        aggregator.flush().remove(0)
    }

    #[test_case(ErrorKind::Interrupted, true ; "interrupted")]
    #[test_case(ErrorKind::WouldBlock, true ; "would block")]
    #[test_case(ErrorKind::TimedOut, true ; "timed out")]
    #[test_case(ErrorKind::ConnectionReset, true ; "reset")]
    #[test_case(ErrorKind::BrokenPipe, false ; "broken pipe")]
    #[test_case(ErrorKind::PermissionDenied, false ; "permission denied")]
    fn io_error_classification(kind: ErrorKind, retryable: bool) {
        let error = std::io::Error::new(kind, "boom");
        assert_eq!(classify_io_error(&error).is_retryable(), retryable);
    }

    #[tokio::test]
    async fn writes_one_record_per_line() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.emit(&candle("BTC/USD")).await.unwrap();
        sink.emit(&candle("ETH/USD")).await.unwrap();
        sink.close().await.unwrap();

        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(r#""symbol":"BTC/USD""#));
        assert!(lines[1].contains(r#""timestamp_ms":60000"#));
    }

    #[tokio::test]
    async fn transient_write_failure_then_success() {
        let candle = candle("BTC/USD");
        let expected = format!("{}\n", encode_candle(&candle).unwrap());
        let writer = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(ErrorKind::Interrupted, "signal"))
            .write(expected.as_bytes())
            .build();
        let mut sink = JsonLinesSink::new(writer);

        let first = sink.emit(&candle).await;
        assert!(matches!(first, Err(EmitError::Transient(_))));
        sink.emit(&candle).await.unwrap();
    }

    #[tokio::test]
    async fn retry_resumes_partially_written_line() {
        let candle = candle("BTC/USD");
        let expected = format!("{}\n", encode_candle(&candle).unwrap());
        let (head, tail) = expected.as_bytes().split_at(expected.len() / 2);
        let writer = tokio_test::io::Builder::new()
            .write(head)
            .write_error(std::io::Error::new(ErrorKind::Interrupted, "signal"))
            .write(tail)
            .build();
        let mut sink = JsonLinesSink::new(writer);

        assert!(matches!(
            sink.emit(&candle).await,
            Err(EmitError::Transient(_))
        ));
        // The mock panics on any byte other than the remaining tail.
        sink.emit(&candle).await.unwrap();
    }

    #[tokio::test]
    async fn different_record_after_torn_line_is_rejected() {
        let btc = candle("BTC/USD");
        let expected = format!("{}\n", encode_candle(&btc).unwrap());
        let (head, _) = expected.as_bytes().split_at(expected.len() / 2);
        let writer = tokio_test::io::Builder::new()
            .write(head)
            .write_error(std::io::Error::new(ErrorKind::Interrupted, "signal"))
            .build();
        let mut sink = JsonLinesSink::new(writer);

        assert!(sink.emit(&btc).await.is_err());
        assert!(matches!(
            sink.emit(&candle("ETH/USD")).await,
            Err(EmitError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn permanent_write_failure_is_rejected() {
        let writer = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(ErrorKind::BrokenPipe, "reader gone"))
            .build();
        let mut sink = JsonLinesSink::new(writer);

        assert!(matches!(
            sink.emit(&candle("BTC/USD")).await,
            Err(EmitError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn appends_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("candles.jsonl");

        let mut sink = JsonLinesSink::append(&path).await.unwrap();
        sink.emit(&candle("BTC/USD")).await.unwrap();
        sink.close().await.unwrap();
        drop(sink);

        let mut sink = JsonLinesSink::append(&path).await.unwrap();
        sink.emit(&candle("ETH/USD")).await.unwrap();
        sink.close().await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn channel_sink_backpressure_and_close() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut sink = ChannelSink::new(tx);

        sink.emit(&candle("BTC/USD")).await.unwrap();
        assert!(matches!(
            sink.emit(&candle("BTC/USD")).await,
            Err(EmitError::Transient(_))
        ));

        assert_eq!(rx.recv().await.unwrap().symbol(), "BTC/USD");
        drop(rx);
        assert!(matches!(
            sink.emit(&candle("BTC/USD")).await,
            Err(EmitError::Rejected(_))
        ));
    }
}
