//! Error types for the fetchq library.

use thiserror::Error;

use crate::job::{JobId, JobStatus};

/// Errors that can occur while submitting or controlling downloads.
#[derive(Error, Debug)]
pub enum Error {
    /// A submission arrived without a URL.
    #[error("URL must not be empty")]
    EmptyUrl,

    /// The URL cannot be mapped to any fetch strategy.
    #[error("Cannot classify {url}: {reason}")]
    Classification {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// No job with the given id is tracked.
    #[error("Job {0} not found")]
    JobNotFound(JobId),

    /// A reorder request referenced a position outside the queue.
    #[error("Invalid reorder: {from} -> {to}")]
    InvalidReorder {
        /// Source index.
        from: usize,
        /// Destination index.
        to: usize,
    },

    /// The job is not in a state that can be re-queued.
    #[error("Job {id} cannot be retried while {status}")]
    NotRetryable {
        /// The job.
        id: JobId,
        /// Its current status.
        status: JobStatus,
    },

    /// An external tool could not be launched.
    #[error("{tool} is not available: {reason}")]
    ToolUnavailable {
        /// Tool binary name or path.
        tool: String,
        /// Launch failure detail.
        reason: String,
    },

    /// The engine control loop has shut down.
    #[error("Engine is not running")]
    EngineStopped,

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// State file (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be parsed.
    #[error("Config parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// Configuration file could not be written.
    #[error("Config write error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// A specialized `Result` type for fetchq operations.
pub type Result<T> = std::result::Result<T, Error>;
