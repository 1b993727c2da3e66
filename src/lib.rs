//! fetchq - A download orchestration engine.
//!
//! Accepts media-page URLs, direct file links, torrent files and magnet links,
//! classifies each into a job, and runs a bounded number of them at a time
//! through external tools (yt-dlp, aria2c) or an embedded torrent session.
//! Queue state survives restarts and every change is pushed to subscribers.
//!
//! # Example
//!
//! ```no_run
//! use fetchq::{EngineBuilder, EngineConfig, Submission};
//!
//! # async fn example() -> fetchq::Result<()> {
//! let engine = EngineBuilder::new(EngineConfig::default().with_max_concurrent(2))
//!     .with_state_file("/var/lib/fetchq/state.json")
//!     .spawn()?;
//!
//! let id = engine
//!     .submit(Submission::new("magnet:?xt=urn:btih:abc&dn=Some+Distro"))
//!     .await?;
//! let snapshot = engine.inspect().await?;
//! println!("job {id}: {} active", snapshot.active.len());
//!
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

#[cfg(feature = "api")]
pub mod api;
pub mod broadcast;
pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod format;
pub mod fs;
pub mod job;
pub mod persist;
pub mod progress;
pub mod queue;
pub mod resume;
pub mod scheduler;
pub mod stats;

// Re-export main types for convenience
pub use classify::{ResolutionHint, Submission};
pub use config::{AppConfig, EngineConfig, Quality, TorrentBackend};
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, Result};
pub use fetch::torrent::{TorrentHandle, TorrentSession};
pub use fetch::{FetchContext, FetchOutcome, FetchStrategy};
pub use fs::{FileSystem, TokioFileSystem};
pub use job::{Job, JobDetails, JobId, JobKind, JobStatus};
pub use queue::QueueSnapshot;
pub use stats::QueueStats;
