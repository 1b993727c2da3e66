//! Job data model and lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Unique, immutable job identifier.
pub type JobId = u64;

/// The fetch-strategy category a job is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// A web page handled by the media extractor.
    Media,
    /// A direct link handled by the segmented downloader.
    File,
    /// A `.torrent` metainfo file.
    Torrent,
    /// A magnet URI.
    Magnet,
}

impl JobKind {
    /// Returns true for kinds that count against the torrent concurrency cap.
    #[must_use]
    pub const fn is_torrent(self) -> bool {
        matches!(self, Self::Torrent | Self::Magnet)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Media => "media",
            Self::File => "file",
            Self::Torrent => "torrent",
            Self::Magnet => "magnet",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a job.
///
/// ```text
/// queued -> starting -> downloading -> processing -> completed
/// queued -> starting -> downloading -> failed
/// any non-terminal -> retrying -> queued
/// queued | active -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Starting,
    Downloading,
    Processing,
    Completed,
    Failed,
    Retrying,
    Cancelled,
}

impl JobStatus {
    /// Statuses during which an external process or engine is running.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Downloading | Self::Processing)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the state machine allows moving from `self` to `next`.
    ///
    /// `Downloading -> Queued` is the re-classification path: a direct file that
    /// turned out to be torrent metadata goes back to the queue under a new kind.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use JobStatus::{
            Cancelled, Completed, Downloading, Failed, Processing, Queued, Retrying, Starting,
        };
        match (self, next) {
            (Queued, Starting)
            | (Starting, Downloading | Processing | Queued)
            | (Downloading, Processing | Queued)
            | (Starting | Downloading | Processing, Completed | Failed)
            | (Retrying, Queued | Failed) => true,
            (from, Retrying) => !from.is_terminal() && !matches!(from, Retrying),
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Starting => "starting",
            Self::Downloading => "downloading",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// BitTorrent swarm counters, only meaningful for torrent and magnet jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwarmStats {
    /// Connected peers.
    pub peers: u32,
    /// Connected seeders, when the engine reports them.
    pub seeds: Option<u32>,
    /// Upload rate display string.
    pub upload_speed: Option<String>,
    /// Uploaded / downloaded bytes.
    pub ratio: f64,
}

/// Kind-specific job fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobDetails {
    Media {
        /// Caller-supplied format selector overriding the quality preference.
        format: Option<String>,
    },
    File {
        /// Filename hint from an upstream resolution step.
        filename: Option<String>,
    },
    Torrent {
        /// Local path of the metainfo file, when it has already been fetched.
        metainfo: Option<String>,
        #[serde(default)]
        swarm: SwarmStats,
    },
    Magnet {
        #[serde(default)]
        swarm: SwarmStats,
    },
}

impl JobDetails {
    /// Creates empty details for `kind`.
    #[must_use]
    pub fn for_kind(kind: JobKind, format: Option<String>) -> Self {
        match kind {
            JobKind::Media => Self::Media { format },
            JobKind::File => Self::File { filename: None },
            JobKind::Torrent => Self::Torrent {
                metainfo: None,
                swarm: SwarmStats::default(),
            },
            JobKind::Magnet => Self::Magnet {
                swarm: SwarmStats::default(),
            },
        }
    }

    #[must_use]
    pub const fn kind(&self) -> JobKind {
        match self {
            Self::Media { .. } => JobKind::Media,
            Self::File { .. } => JobKind::File,
            Self::Torrent { .. } => JobKind::Torrent,
            Self::Magnet { .. } => JobKind::Magnet,
        }
    }

    #[must_use]
    pub const fn swarm(&self) -> Option<&SwarmStats> {
        match self {
            Self::Torrent { swarm, .. } | Self::Magnet { swarm } => Some(swarm),
            _ => None,
        }
    }

    pub const fn swarm_mut(&mut self) -> Option<&mut SwarmStats> {
        match self {
            Self::Torrent { swarm, .. } | Self::Magnet { swarm } => Some(swarm),
            _ => None,
        }
    }
}

/// One user-submitted download request and its tracked state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub url: String,
    pub title: String,
    pub details: JobDetails,
    pub status: JobStatus,
    /// 0-100, fractional allowed.
    pub progress: f64,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub size: Option<String>,
    /// Classified, human-readable failure message.
    pub error: Option<String>,
    pub retry_count: u32,
    /// File or directory the strategy writes to, once known.
    pub output: Option<String>,
    pub added_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Raw tool output behind `error`; kept for logs, never serialized.
    #[serde(skip)]
    pub diagnostic: Option<String>,
    /// Live handle to the running process or engine; set only while active.
    #[serde(skip)]
    pub handle: Option<CancellationToken>,
}

impl Job {
    /// Creates a freshly queued job.
    #[must_use]
    pub fn new(id: JobId, url: String, title: String, details: JobDetails) -> Self {
        Self {
            id,
            url,
            title,
            details,
            status: JobStatus::Queued,
            progress: 0.0,
            speed: None,
            eta: None,
            size: None,
            error: None,
            retry_count: 0,
            output: None,
            added_at: Utc::now(),
            started_at: None,
            completed_at: None,
            diagnostic: None,
            handle: None,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> JobKind {
        self.details.kind()
    }

    /// Clears progress and transfer fields ahead of a fresh attempt.
    pub fn reset_transient(&mut self) {
        self.progress = 0.0;
        self.speed = None;
        self.eta = None;
        self.started_at = None;
        self.completed_at = None;
        self.handle = None;
        if let Some(swarm) = self.details.swarm_mut() {
            *swarm = SwarmStats::default();
        }
    }
}
