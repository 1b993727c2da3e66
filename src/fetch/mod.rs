//! Fetch strategies: one per job kind, each driving an external tool or
//! embedded engine to completion for a single job.
//!
//! A strategy never touches the queue. It reports through a [`JobReporter`]
//! onto the control loop's channel and returns a [`FetchOutcome`] when done.

pub mod diagnose;
pub mod file;
pub mod media;
pub mod process;
pub mod torrent;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::job::{Job, JobId, JobKind, JobStatus};
use crate::progress::ProgressUpdate;

pub use file::FileStrategy;
pub use media::MediaStrategy;
pub use torrent::{
    TorrentEvent, TorrentFile, TorrentHandle, TorrentProgress, TorrentSession, TorrentSource,
    TorrentStrategy,
};

/// Error taxonomy for a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network, timeout or unexplained non-zero exit. Eligible for retry.
    Transient,
    /// Authentication, DRM or geo-blocking.
    Access,
    /// The site or content cannot be handled by the tool.
    Unsupported,
    /// Disk space, permissions or a missing tool.
    Resource,
    /// A rejected option or unusable resume state.
    MalformedOption,
    /// No swarm peers appeared before the start timeout.
    PeerConnectivity,
}

impl FailureClass {
    /// Returns true if the engine may retry automatically after a delay.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// A classified fetch failure with a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub class: FailureClass,
    pub message: String,
    /// Raw tool output the message was derived from.
    pub diagnostic: Option<String>,
}

impl FetchFailure {
    #[must_use]
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            diagnostic: None,
        }
    }

    #[must_use]
    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// How a strategy run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Completed,
    Failed(FetchFailure),
    /// The content turned out to be of another kind; re-queue it as such.
    Reclassify {
        kind: JobKind,
        metainfo: Option<PathBuf>,
    },
    Cancelled,
}

/// A strategy's report about the job it is running.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyEvent {
    Status(JobStatus),
    Progress(ProgressUpdate),
    Output(PathBuf),
}

/// A [`StrategyEvent`] tagged with its job.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub id: JobId,
    pub event: StrategyEvent,
}

/// Per-job sender for strategy events.
///
/// Progress is gated: an update is forwarded when its percentage differs
/// from the last one sent, or when the minimum interval has passed since
/// the last send.
#[derive(Debug)]
pub struct JobReporter {
    id: JobId,
    tx: mpsc::UnboundedSender<Report>,
    interval: std::time::Duration,
    last_progress: Option<f64>,
    last_sent: Option<Instant>,
}

impl JobReporter {
    #[must_use]
    pub const fn new(
        id: JobId,
        tx: mpsc::UnboundedSender<Report>,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            id,
            tx,
            interval,
            last_progress: None,
            last_sent: None,
        }
    }

    #[must_use]
    pub const fn id(&self) -> JobId {
        self.id
    }

    fn send(&self, event: StrategyEvent) {
        // The control loop only goes away at shutdown, when results no longer matter.
        let _ = self.tx.send(Report { id: self.id, event });
    }

    pub fn status(&self, status: JobStatus) {
        self.send(StrategyEvent::Status(status));
    }

    pub fn output(&self, path: impl Into<PathBuf>) {
        self.send(StrategyEvent::Output(path.into()));
    }

    /// Forwards `update` if the gate allows it; returns true if sent.
    pub fn progress(&mut self, update: ProgressUpdate) -> bool {
        if update.is_empty() {
            return false;
        }
        let moved = update
            .progress
            .is_some_and(|p| self.last_progress.is_none_or(|last| (p - last).abs() > f64::EPSILON));
        let due = self
            .last_sent
            .is_none_or(|at| at.elapsed() >= self.interval);
        if !moved && !due {
            return false;
        }
        if update.progress.is_some() {
            self.last_progress = update.progress;
        }
        self.last_sent = Some(Instant::now());
        self.send(StrategyEvent::Progress(update));
        true
    }
}

/// Returns true if `update` shows bytes actually moving: the percentage went
/// up, or the tool reports a non-zero download rate.
///
/// `high` tracks the highest percentage seen so far.
pub(crate) fn shows_transfer(update: &ProgressUpdate, high: &mut f64) -> bool {
    let advanced = update.progress.is_some_and(|p| p > *high);
    if let Some(p) = update.progress {
        *high = high.max(p);
    }
    let flowing = update
        .speed
        .as_deref()
        .and_then(crate::format::parse_bytes)
        .is_some_and(|rate| rate > 0);
    advanced || flowing
}

/// Everything a strategy needs to run one job.
#[derive(Debug)]
pub struct FetchContext {
    /// The job as it was when dispatched.
    pub job: Job,
    pub config: Arc<EngineConfig>,
    pub reporter: JobReporter,
    pub cancel: CancellationToken,
}

/// Drives one kind of job to completion.
///
/// Implementations must release their process or engine on every exit path
/// and must return [`FetchOutcome::Cancelled`] promptly once `ctx.cancel`
/// fires.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
    async fn fetch(&self, ctx: FetchContext) -> FetchOutcome;
}
