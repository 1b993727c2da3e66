//! The authoritative in-memory model of every tracked job.
//!
//! Jobs are moved between collections by value, so a job can never be both
//! queued and active. Only the engine's control loop owns a [`QueueStore`].

use std::collections::{BTreeMap, VecDeque};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::job::{Job, JobId, JobStatus};
use crate::stats::{QueueStats, TransferRates};

/// Which collection a job was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Queued,
    Active,
    Retrying,
    History,
}

/// A cleaned, serializable view of the whole store at one instant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub queued: Vec<Job>,
    pub active: Vec<Job>,
    pub retrying: Vec<Job>,
    /// Terminal jobs, newest first.
    pub completed_history: Vec<Job>,
    pub stats: QueueStats,
    pub total_download_rate: String,
    pub total_upload_rate: String,
    pub queue_enabled: bool,
    pub max_concurrent: usize,
}

#[derive(Debug)]
pub struct QueueStore {
    queued: Vec<Job>,
    active: BTreeMap<JobId, Job>,
    retrying: BTreeMap<JobId, Job>,
    history: VecDeque<Job>,
    next_id: JobId,
    history_limit: usize,
    max_concurrent: usize,
    enabled: bool,
}

impl QueueStore {
    /// Creates an empty, enabled store. A concurrency limit of zero is raised to one.
    #[must_use]
    pub const fn new(max_concurrent: usize, history_limit: usize) -> Self {
        let max_concurrent = if max_concurrent == 0 { 1 } else { max_concurrent };
        Self {
            queued: Vec::new(),
            active: BTreeMap::new(),
            retrying: BTreeMap::new(),
            history: VecDeque::new(),
            next_id: 1,
            history_limit,
            max_concurrent,
            enabled: true,
        }
    }

    /// Hands out the next job id.
    pub const fn allocate_id(&mut self) -> JobId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    #[must_use]
    pub const fn next_id(&self) -> JobId {
        self.next_id
    }

    /// Raises the id counter so restored jobs never collide with new ones.
    pub fn bump_next_id(&mut self, at_least: JobId) {
        self.next_id = self.next_id.max(at_least);
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub const fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    #[must_use]
    pub const fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Sets the global concurrency limit; zero is raised to one.
    pub fn set_max_concurrent(&mut self, max: usize) {
        self.max_concurrent = max.max(1);
    }

    #[must_use]
    pub fn queued(&self) -> &[Job] {
        &self.queued
    }

    pub fn active(&self) -> impl Iterator<Item = &Job> {
        self.active.values()
    }

    pub fn retrying(&self) -> impl Iterator<Item = &Job> {
        self.retrying.values()
    }

    /// Terminal jobs, newest first.
    pub fn history(&self) -> impl Iterator<Item = &Job> {
        self.history.iter()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn active_torrent_count(&self) -> usize {
        self.active.values().filter(|j| j.kind().is_torrent()).count()
    }

    /// Returns the job with `id` and where it lives.
    #[must_use]
    pub fn find(&self, id: JobId) -> Option<(Location, &Job)> {
        if let Some(job) = self.active.get(&id) {
            return Some((Location::Active, job));
        }
        if let Some(job) = self.queued.iter().find(|j| j.id == id) {
            return Some((Location::Queued, job));
        }
        if let Some(job) = self.retrying.get(&id) {
            return Some((Location::Retrying, job));
        }
        self.history
            .iter()
            .find(|j| j.id == id)
            .map(|job| (Location::History, job))
    }

    pub fn active_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.active.get_mut(&id)
    }

    /// Appends a job to the back of the queue.
    pub fn enqueue(&mut self, mut job: Job) {
        job.status = JobStatus::Queued;
        job.handle = None;
        self.queued.push(job);
    }

    /// Puts a job at the front of the queue.
    pub fn enqueue_front(&mut self, mut job: Job) {
        job.status = JobStatus::Queued;
        job.handle = None;
        self.queued.insert(0, job);
    }

    /// Moves a queued job into the active set with status `starting`.
    ///
    /// The cancellation token becomes the job's live handle.
    pub fn promote(&mut self, id: JobId, handle: CancellationToken) -> Option<&Job> {
        let index = self.queued.iter().position(|j| j.id == id)?;
        let mut job = self.queued.remove(index);
        job.status = JobStatus::Starting;
        job.started_at = Some(Utc::now());
        job.completed_at = None;
        job.error = None;
        job.handle = Some(handle);
        let slot = self.active.entry(id).or_insert(job);
        Some(&*slot)
    }

    /// Removes a job from the active set, clearing its live handle.
    pub fn take_active(&mut self, id: JobId) -> Option<Job> {
        let mut job = self.active.remove(&id)?;
        job.handle = None;
        Some(job)
    }

    /// Removes a job from the queue without touching its status.
    pub fn take_queued(&mut self, id: JobId) -> Option<Job> {
        let index = self.queued.iter().position(|j| j.id == id)?;
        Some(self.queued.remove(index))
    }

    /// Cancels a queued job: list removal only, other positions unchanged.
    pub fn cancel_queued(&mut self, id: JobId) -> Option<&Job> {
        let mut job = self.take_queued(id)?;
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        self.push_history(job);
        self.history.front()
    }

    /// Parks a job in `retrying` until its delay elapses.
    pub fn hold_retrying(&mut self, mut job: Job) {
        job.status = JobStatus::Retrying;
        job.handle = None;
        self.retrying.insert(job.id, job);
    }

    pub fn take_retrying(&mut self, id: JobId) -> Option<Job> {
        self.retrying.remove(&id)
    }

    /// Records a terminal job, evicting the oldest entries past the cap.
    pub fn push_history(&mut self, mut job: Job) {
        job.handle = None;
        self.history.push_front(job);
        while self.history.len() > self.history_limit {
            if let Some(evicted) = self.history.pop_back() {
                log::debug!("Evicted job {} from history", evicted.id);
            }
        }
    }

    pub fn take_history(&mut self, id: JobId) -> Option<Job> {
        let index = self.history.iter().position(|j| j.id == id)?;
        self.history.remove(index)
    }

    /// Moves a still-queued job from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidReorder`] if either index is out of bounds.
    pub fn reorder(&mut self, from: usize, to: usize) -> Result<()> {
        let len = self.queued.len();
        if from >= len || to >= len {
            return Err(Error::InvalidReorder { from, to });
        }
        let job = self.queued.remove(from);
        self.queued.insert(to, job);
        Ok(())
    }

    /// Drops completed and cancelled history entries; failed ones stay for retry.
    pub fn clear_completed(&mut self) -> usize {
        let before = self.history.len();
        self.history
            .retain(|j| !matches!(j.status, JobStatus::Completed | JobStatus::Cancelled));
        before - self.history.len()
    }

    /// Ids of failed history entries, oldest first.
    #[must_use]
    pub fn failed_ids(&self) -> Vec<JobId> {
        self.history
            .iter()
            .rev()
            .filter(|j| j.status == JobStatus::Failed)
            .map(|j| j.id)
            .collect()
    }

    /// Builds the canonical snapshot sent to observers.
    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        let rates = TransferRates::sum(self.active.values());
        QueueSnapshot {
            queued: self.queued.iter().map(cleaned).collect(),
            active: self.active.values().map(cleaned).collect(),
            retrying: self.retrying.values().map(cleaned).collect(),
            completed_history: self.history.iter().map(cleaned).collect(),
            stats: QueueStats::collect(
                self.queued.len(),
                self.active.len(),
                self.retrying.len(),
                &self.history,
            ),
            total_download_rate: rates.download_display(),
            total_upload_rate: rates.upload_display(),
            queue_enabled: self.enabled,
            max_concurrent: self.max_concurrent,
        }
    }
}

/// Copies a job without its live handle or raw tool output.
fn cleaned(job: &Job) -> Job {
    let mut job = job.clone();
    job.handle = None;
    job.diagnostic = None;
    job
}
