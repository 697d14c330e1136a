//! Trade Source Adapters
//!
//! Implementations of the `TradeSource` port.
//!
//! - `FeedSource`: live Kraken feed events; positions are per-run sequence
//!   numbers and cannot be replayed
//! - `JsonLinesSource`: one JSON trade record per line from stdin or a file;
//!   positions are 1-based line numbers, optionally checkpointed so a
//!   restart resumes after the last acknowledged line

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    SourceError, SourcePoll, SourcePosition, SourceRecord, TradeSource,
};
use crate::domain::market::Trade;
use crate::infrastructure::codec::decode_trade;
use crate::infrastructure::kraken::FeedEvent;
use crate::infrastructure::metrics;

// =============================================================================
// Feed Source
// =============================================================================

/// `TradeSource` over the Kraken client's event channel.
pub struct FeedSource {
    events: mpsc::Receiver<FeedEvent>,
    cancel: CancellationToken,
    buffered: VecDeque<Trade>,
    sequence: u64,
    last_acked: Option<SourcePosition>,
}

impl FeedSource {
    /// Wrap a feed event receiver.
    ///
    /// `cancel` distinguishes a shutdown-driven channel close from the
    /// client dying underneath the pipeline.
    #[must_use]
    pub const fn new(events: mpsc::Receiver<FeedEvent>, cancel: CancellationToken) -> Self {
        Self {
            events,
            cancel,
            buffered: VecDeque::new(),
            sequence: 0,
            last_acked: None,
        }
    }

    /// Last position the driver acknowledged.
    #[must_use]
    pub const fn last_acked(&self) -> Option<SourcePosition> {
        self.last_acked
    }

    fn next_buffered(&mut self) -> Option<SourcePoll> {
        let trade = self.buffered.pop_front()?;
        self.sequence += 1;
        Some(SourcePoll::Record(SourceRecord {
            trade,
            position: SourcePosition(self.sequence),
        }))
    }
}

#[async_trait]
impl TradeSource for FeedSource {
    async fn connect(&mut self) -> Result<(), SourceError> {
        loop {
            match self.events.recv().await {
                Some(FeedEvent::Connected) => {
                    tracing::info!("Trade feed connected");
                    return Ok(());
                }
                Some(FeedEvent::Trades(trades)) => self.buffered.extend(trades),
                Some(FeedEvent::Error(message)) => {
                    tracing::warn!(error = %message, "Trade feed error while connecting");
                }
                Some(FeedEvent::Disconnected | FeedEvent::Reconnecting { .. }) => {}
                None => {
                    return Err(SourceError::Connect(
                        "feed client stopped before connecting".to_string(),
                    ));
                }
            }
        }
    }

    async fn next(&mut self, timeout: Duration) -> Result<SourcePoll, SourceError> {
        if let Some(poll) = self.next_buffered() {
            return Ok(poll);
        }

        match tokio::time::timeout(timeout, self.events.recv()).await {
            Err(_) => Ok(SourcePoll::NoData),
            Ok(Some(FeedEvent::Trades(trades))) => {
                self.buffered.extend(trades);
                Ok(self.next_buffered().unwrap_or(SourcePoll::NoData))
            }
            Ok(Some(FeedEvent::Connected)) => {
                tracing::info!("Trade feed reconnected");
                Ok(SourcePoll::NoData)
            }
            Ok(Some(FeedEvent::Disconnected)) => {
                tracing::warn!("Trade feed disconnected");
                Ok(SourcePoll::NoData)
            }
            Ok(Some(FeedEvent::Reconnecting { attempt })) => {
                tracing::info!(attempt, "Trade feed reconnecting");
                Ok(SourcePoll::NoData)
            }
            Ok(Some(FeedEvent::Error(message))) => {
                tracing::warn!(error = %message, "Trade feed error");
                Ok(SourcePoll::NoData)
            }
            Ok(None) if self.cancel.is_cancelled() => Ok(SourcePoll::NoData),
            Ok(None) => Err(SourceError::Disconnected(
                "feed client stopped".to_string(),
            )),
        }
    }

    async fn ack(&mut self, position: SourcePosition) -> Result<(), SourceError> {
        // A live tape cannot be replayed; acknowledgements only track progress.
        self.last_acked = Some(position);
        Ok(())
    }
}

// =============================================================================
// Checkpoint
// =============================================================================

/// Last acknowledged line number, persisted atomically (write + rename).
#[derive(Debug, Clone)]
pub struct Checkpoint {
    path: PathBuf,
}

impl Checkpoint {
    /// Checkpoint stored at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Checkpoint file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored position, `None` if no checkpoint exists yet.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Checkpoint` if the file exists but cannot be
    /// read or parsed.
    pub async fn load(&self) -> Result<Option<SourcePosition>, SourceError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents
                .trim()
                .parse::<u64>()
                .map(|value| Some(SourcePosition(value)))
                .map_err(|e| {
                    SourceError::Checkpoint(format!("{}: {e}", self.path.display()))
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SourceError::Checkpoint(format!(
                "{}: {e}",
                self.path.display()
            ))),
        }
    }

    /// Persist `position`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Checkpoint` if the file cannot be written.
    pub async fn store(&self, position: SourcePosition) -> Result<(), SourceError> {
        let tmp = self.path.with_extension("tmp");
        let write = async {
            tokio::fs::write(&tmp, position.to_string()).await?;
            tokio::fs::rename(&tmp, &self.path).await
        };
        write
            .await
            .map_err(|e| SourceError::Checkpoint(format!("{}: {e}", self.path.display())))
    }
}

// =============================================================================
// JSON Lines Source
// =============================================================================

/// `TradeSource` over newline-delimited JSON trade records.
pub struct JsonLinesSource<R> {
    lines: Lines<R>,
    label: &'static str,
    line_number: u64,
    resume_after: u64,
    checkpoint: Option<Checkpoint>,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    /// Read records from `reader`.
    #[must_use]
    pub fn new(reader: R, label: &'static str) -> Self {
        Self {
            lines: reader.lines(),
            label,
            line_number: 0,
            resume_after: 0,
            checkpoint: None,
        }
    }

    /// Persist acknowledgements to `checkpoint` and skip already
    /// acknowledged lines on connect.
    #[must_use]
    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Lines consumed so far.
    #[must_use]
    pub const fn line_number(&self) -> u64 {
        self.line_number
    }
}

impl JsonLinesSource<BufReader<tokio::io::Stdin>> {
    /// Read records from standard input.
    #[must_use]
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), "stdin")
    }
}

impl JsonLinesSource<BufReader<tokio::fs::File>> {
    /// Read records from a file.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Io` if the file cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::new(BufReader::new(file), "file"))
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> TradeSource for JsonLinesSource<R> {
    async fn connect(&mut self) -> Result<(), SourceError> {
        let Some(checkpoint) = &self.checkpoint else {
            return Ok(());
        };
        if let Some(position) = checkpoint.load().await? {
            tracing::info!(
                %position,
                path = %checkpoint.path().display(),
                "Resuming after checkpoint"
            );
            self.resume_after = position.value();
        }
        Ok(())
    }

    async fn next(&mut self, timeout: Duration) -> Result<SourcePoll, SourceError> {
        loop {
            let line = match tokio::time::timeout(timeout, self.lines.next_line()).await {
                Err(_) => return Ok(SourcePoll::NoData),
                Ok(Ok(None)) => return Ok(SourcePoll::Exhausted),
                Ok(Ok(Some(line))) => line,
                Ok(Err(e)) => return Err(e.into()),
            };
            self.line_number += 1;

            if self.line_number <= self.resume_after || line.trim().is_empty() {
                continue;
            }

            match decode_trade(&line) {
                Ok(trade) => {
                    return Ok(SourcePoll::Record(SourceRecord {
                        trade,
                        position: SourcePosition(self.line_number),
                    }));
                }
                Err(e) => {
                    tracing::warn!(
                        line = self.line_number,
                        error = %e,
                        "Skipping malformed trade record"
                    );
                    metrics::record_malformed_record(self.label);
                }
            }
        }
    }

    async fn ack(&mut self, position: SourcePosition) -> Result<(), SourceError> {
        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.store(position).await?;
        }
        Ok(())
    }
}
