//! Throttled relay for blob transfer events.
//!
//! Sources push [`ProgressEvent`]s through a [`ProgressSender`] while fetching
//! blobs. A single background task drains a bounded `broadcast` queue and turns
//! the stream into at most one status line per interval, written to the log or,
//! in interactive mode, onto an `indicatif` spinner.
//!
//! Sending never blocks: when the queue is full the oldest pending events are
//! overwritten and counted as dropped. [`ProgressRelay::finish`] closes the
//! queue, waits for the consumer to drain it, and returns what happened.

use indicatif::ProgressBar;
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const DEFAULT_CAPACITY: usize = 256;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressKind {
    NewArtifact,
    Reading,
    Done,
    Skipped,
}

impl fmt::Display for ProgressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProgressKind::NewArtifact => "new-artifact",
            ProgressKind::Reading => "reading",
            ProgressKind::Done => "done",
            ProgressKind::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    /// Digest of the blob the event is about.
    pub artifact: String,
    /// Bytes transferred so far, when known.
    pub offset: Option<u64>,
    /// Expected size, when known.
    pub total: Option<u64>,
}

impl ProgressEvent {
    pub fn new(kind: ProgressKind, artifact: impl Into<String>) -> Self {
        Self {
            kind,
            artifact: artifact.into(),
            offset: None,
            total: None,
        }
    }

    pub fn with_offset(mut self, offset: u64, total: Option<u64>) -> Self {
        self.offset = Some(offset);
        self.total = total;
        self
    }

    fn describe(&self) -> String {
        match (self.offset, self.total) {
            (Some(offset), Some(total)) if total > 0 => format!(
                "{} {} {}/{} bytes ({}%)",
                self.kind,
                short_digest(&self.artifact),
                offset,
                total,
                offset.saturating_mul(100) / total
            ),
            (Some(offset), _) => format!(
                "{} {} {} bytes",
                self.kind,
                short_digest(&self.artifact),
                offset
            ),
            _ => format!("{} {}", self.kind, short_digest(&self.artifact)),
        }
    }
}

fn short_digest(digest: &str) -> &str {
    let hex = digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest);
    hex.get(..12).unwrap_or(hex)
}

/// Producer handle. Sending is fire-and-forget.
#[derive(Debug)]
pub struct ProgressSender {
    tx: Option<broadcast::Sender<ProgressEvent>>,
}

impl ProgressSender {
    /// A sender whose events go nowhere.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            // No receiver only happens after the relay stopped; nothing to report to.
            let _ = tx.send(event);
        }
    }
}

/// Where throttled status lines go.
#[derive(Clone, Default)]
pub enum RelayDisplay {
    #[default]
    Log,
    Spinner(ProgressBar),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub received: u64,
    pub emitted: u64,
    pub dropped: u64,
}

#[derive(Clone)]
pub struct RelaySettings {
    pub capacity: usize,
    pub interval: Duration,
    pub display: RelayDisplay,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            interval: DEFAULT_INTERVAL,
            display: RelayDisplay::Log,
        }
    }
}

/// One relay per pull; see the module docs.
pub struct ProgressRelay {
    sender: ProgressSender,
    handle: JoinHandle<RelayStats>,
}

impl ProgressRelay {
    /// Starts the consumer task. Must be called from within a tokio runtime.
    pub fn spawn(label: impl Into<String>, settings: RelaySettings) -> Self {
        let (tx, rx) = broadcast::channel(settings.capacity.max(1));
        let handle = tokio::spawn(consume(label.into(), rx, settings.interval, settings.display));
        Self {
            sender: ProgressSender { tx: Some(tx) },
            handle,
        }
    }

    pub fn sender(&self) -> &ProgressSender {
        &self.sender
    }

    /// Closes the queue, drains what is left and stops the consumer.
    pub async fn finish(self) -> RelayStats {
        let ProgressRelay { sender, handle } = self;
        drop(sender);
        match handle.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Progress relay task ended abnormally: {}", e);
                RelayStats::default()
            }
        }
    }
}

async fn consume(
    label: String,
    mut rx: broadcast::Receiver<ProgressEvent>,
    interval: Duration,
    display: RelayDisplay,
) -> RelayStats {
    let mut stats = RelayStats::default();
    let mut last_emit: Option<Instant> = None;

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                stats.dropped += skipped;
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        stats.received += 1;

        let now = Instant::now();
        let due = last_emit.map_or(true, |at| now.duration_since(at) >= interval);
        if !due {
            continue;
        }
        last_emit = Some(now);
        stats.emitted += 1;

        let line = event.describe();
        match &display {
            RelayDisplay::Log => info!("Pull progress image={} {}", label, line),
            RelayDisplay::Spinner(bar) => bar.set_message(format!("{}: {}", label, line)),
        }
    }

    debug!(
        "Progress relay stopped image={} received={} emitted={} dropped={}",
        label, stats.received, stats.emitted, stats.dropped
    );
    stats
}
