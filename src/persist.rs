//! Queue state persistence across restarts.
//!
//! The control loop captures a [`StateFile`] after every material change and
//! hands it to a [`StateWriter`], which coalesces bursts into one atomic write
//! per debounce window on its own task.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::job::{Job, JobId, JobStatus};
use crate::queue::QueueStore;

/// Current schema version of the state document.
pub const STATE_VERSION: u32 = 1;

/// Queue settings that survive a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub max_concurrent: usize,
    pub queue_enabled: bool,
}

/// The durable state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub next_id: JobId,
    /// Every non-terminal job: active and retrying first, then the queue.
    pub queue: Vec<Job>,
    /// Terminal history, newest first.
    pub completed_downloads: Vec<Job>,
    pub settings: Settings,
}

impl StateFile {
    /// Captures the persistable part of `store`.
    #[must_use]
    pub fn capture(store: &QueueStore) -> Self {
        let queue = store
            .active()
            .chain(store.retrying())
            .chain(store.queued())
            .cloned()
            .collect();
        Self {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            next_id: store.next_id(),
            queue,
            completed_downloads: store.history().cloned().collect(),
            settings: Settings {
                max_concurrent: store.max_concurrent(),
                queue_enabled: store.is_enabled(),
            },
        }
    }

    /// Rebuilds a store, re-queueing every job that was in flight.
    #[must_use]
    pub fn into_store(self, history_limit: usize) -> QueueStore {
        let mut store = QueueStore::new(self.settings.max_concurrent, history_limit);
        store.set_enabled(self.settings.queue_enabled);

        let mut max_id = 0;
        // History is stored newest first; push oldest first to keep that order.
        for job in self.completed_downloads.into_iter().rev() {
            max_id = max_id.max(job.id);
            store.push_history(job);
        }
        for job in self.queue {
            max_id = max_id.max(job.id);
            if job.status.is_terminal() {
                store.push_history(job);
            } else {
                store.enqueue(reconcile(job));
            }
        }
        store.bump_next_id(self.next_id.max(max_id + 1));
        store
    }
}

/// Resets a job that cannot have kept running across a restart.
#[must_use]
pub fn reconcile(mut job: Job) -> Job {
    if !job.status.is_terminal() {
        if job.status != JobStatus::Queued {
            log::info!("Re-queueing job {} (was {})", job.id, job.status);
        }
        job.status = JobStatus::Queued;
        job.reset_transient();
    }
    job
}

/// Result of reading the state file at startup.
#[derive(Debug)]
pub enum LoadOutcome {
    /// No state file exists yet.
    Missing,
    Loaded(StateFile),
    /// The file could not be used and was renamed aside.
    Quarantined(PathBuf),
}

/// Reads the state file. Never fails: unreadable or unparsable files are
/// moved aside and the engine starts empty.
#[must_use]
pub fn load(path: &Path) -> LoadOutcome {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return LoadOutcome::Missing,
        Err(e) => {
            log::warn!("Cannot read state file {}: {e}", path.display());
            return quarantine(path);
        }
    };

    match serde_json::from_str::<StateFile>(&contents) {
        Ok(state) if state.version <= STATE_VERSION => LoadOutcome::Loaded(state),
        Ok(state) => {
            log::warn!(
                "State file {} has unknown version {}",
                path.display(),
                state.version
            );
            quarantine(path)
        }
        Err(e) => {
            log::warn!("State file {} is corrupt: {e}", path.display());
            quarantine(path)
        }
    }
}

fn quarantine(path: &Path) -> LoadOutcome {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".corrupt-{stamp}"));
    let target = PathBuf::from(name);
    match std::fs::rename(path, &target) {
        Ok(()) => log::warn!("Moved unusable state file to {}", target.display()),
        Err(e) => log::error!("Cannot move state file {} aside: {e}", path.display()),
    }
    LoadOutcome::Quarantined(target)
}

/// Writes the state file atomically (write tmp + rename).
///
/// # Errors
///
/// Returns an error if the directory cannot be created, the document cannot
/// be serialized, or the file cannot be written.
pub fn save(path: &Path, state: &StateFile) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(state)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Debounced background writer for the state file.
pub struct StateWriter {
    tx: watch::Sender<Option<Arc<StateFile>>>,
    flush: CancellationToken,
    task: JoinHandle<()>,
}

impl StateWriter {
    /// Spawns the writer task on the current runtime.
    #[must_use]
    pub fn spawn(path: PathBuf, debounce: Duration) -> Self {
        let (tx, rx) = watch::channel(None);
        let flush = CancellationToken::new();
        let task = tokio::spawn(write_loop(path, debounce, rx, flush.clone()));
        Self { tx, flush, task }
    }

    /// Replaces the pending state; it is written once the window closes.
    pub fn schedule(&self, state: StateFile) {
        self.tx.send_replace(Some(Arc::new(state)));
    }

    /// Writes any pending state immediately and stops the task.
    pub async fn close(self) {
        self.flush.cancel();
        drop(self.tx);
        if let Err(e) = self.task.await {
            log::error!("State writer task failed: {e}");
        }
    }
}

async fn write_loop(
    path: PathBuf,
    debounce: Duration,
    mut rx: watch::Receiver<Option<Arc<StateFile>>>,
    flush: CancellationToken,
) {
    while rx.changed().await.is_ok() {
        tokio::select! {
            () = tokio::time::sleep(debounce) => {}
            () = flush.cancelled() => {}
        }
        let Some(state) = rx.borrow_and_update().clone() else {
            continue;
        };
        let target = path.clone();
        match tokio::task::spawn_blocking(move || save(&target, &state)).await {
            Ok(Ok(())) => log::debug!("Saved state to {}", path.display()),
            Ok(Err(e)) => log::error!("Failed to save state to {}: {e}", path.display()),
            Err(e) => log::error!("State save task failed: {e}"),
        }
    }
}
