//! The control loop and the handle used to drive it.
//!
//! One dispatcher task owns the [`QueueStore`]. Callers talk to it through a
//! cloneable [`Engine`] handle; running strategies talk to it through their
//! [`JobReporter`] and by returning a [`FetchOutcome`]. Every mutation of the
//! store therefore happens on the dispatcher's timeline and promote steps
//! never race.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::broadcast::{Broadcaster, SnapshotReceiver, Urgency};
use crate::classify::{Submission, classify, derive_title};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::fetch::{
    FailureClass, FetchContext, FetchFailure, FetchOutcome, FetchStrategy, FileStrategy,
    JobReporter, MediaStrategy, Report, StrategyEvent, TorrentSession, TorrentStrategy,
};
use crate::format::format_duration;
use crate::job::{Job, JobDetails, JobId, JobKind, JobStatus, SwarmStats};
use crate::persist::{self, LoadOutcome, StateFile, StateWriter};
use crate::progress;
use crate::queue::{Location, QueueSnapshot, QueueStore};
use crate::resume::{ResumeScanner, ScanReport};
use crate::scheduler::{Budget, plan_promotions};

/// Time allowed after the kill grace for strategies to report back at shutdown.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(2);

/// Floor for the throttle tick; a zero interval would spin.
const MIN_TICK: Duration = Duration::from_millis(10);

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Submit(Submission, Reply<Result<JobId>>),
    Inspect(Reply<QueueSnapshot>),
    SetEnabled(bool, Reply<()>),
    SetMaxConcurrent(usize, Reply<()>),
    Cancel(JobId, Reply<Result<()>>),
    Reorder {
        from: usize,
        to: usize,
        reply: Reply<Result<()>>,
    },
    Retry(JobId, Reply<Result<()>>),
    RetryAllFailed(Reply<usize>),
    ClearCompleted(Reply<usize>),
    Remove(JobId, Reply<Result<()>>),
    Subscribe(Reply<SnapshotReceiver>),
    Shutdown(Reply<()>),
}

/// Messages from tasks the dispatcher spawned.
enum Internal {
    Finished { id: JobId, outcome: FetchOutcome },
    RetryDue(JobId),
    Scanned(ScanReport),
}

/// Handle to a running engine.
///
/// Every method fails with [`Error::EngineStopped`] once the engine has
/// shut down.
#[derive(Debug, Clone)]
pub struct Engine {
    tx: mpsc::UnboundedSender<Command>,
}

impl Engine {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).map_err(|_| Error::EngineStopped)?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    /// Classifies and queues a download.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyUrl`] or [`Error::Classification`] if the URL
    /// cannot become a job.
    pub async fn submit(&self, submission: Submission) -> Result<JobId> {
        self.request(|reply| Command::Submit(submission, reply))
            .await?
    }

    /// Returns the current queue snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineStopped`] if the engine is gone.
    pub async fn inspect(&self) -> Result<QueueSnapshot> {
        self.request(Command::Inspect).await
    }

    /// Stops promoting queued jobs. Active jobs keep running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineStopped`] if the engine is gone.
    pub async fn pause(&self) -> Result<()> {
        self.request(|reply| Command::SetEnabled(false, reply)).await
    }

    /// Resumes promoting queued jobs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineStopped`] if the engine is gone.
    pub async fn resume(&self) -> Result<()> {
        self.request(|reply| Command::SetEnabled(true, reply)).await
    }

    /// Changes the global concurrency limit (at least one).
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineStopped`] if the engine is gone.
    pub async fn set_max_concurrent(&self, max: usize) -> Result<()> {
        self.request(|reply| Command::SetMaxConcurrent(max, reply))
            .await
    }

    /// Cancels a queued, active or retrying job.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobNotFound`] for an unknown id.
    pub async fn cancel(&self, id: JobId) -> Result<()> {
        self.request(|reply| Command::Cancel(id, reply)).await?
    }

    /// Moves the queued job at `from` to position `to`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidReorder`] if either index is out of bounds.
    pub async fn reorder(&self, from: usize, to: usize) -> Result<()> {
        self.request(|reply| Command::Reorder { from, to, reply })
            .await?
    }

    /// Re-queues a failed or cancelled job, or a retrying job without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobNotFound`] for an unknown id and
    /// [`Error::NotRetryable`] for a job that is queued, active or completed.
    pub async fn retry(&self, id: JobId) -> Result<()> {
        self.request(|reply| Command::Retry(id, reply)).await?
    }

    /// Re-queues every failed job; returns how many.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineStopped`] if the engine is gone.
    pub async fn retry_all_failed(&self) -> Result<usize> {
        self.request(Command::RetryAllFailed).await
    }

    /// Drops completed and cancelled jobs from history; returns how many.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineStopped`] if the engine is gone.
    pub async fn clear_completed(&self) -> Result<usize> {
        self.request(Command::ClearCompleted).await
    }

    /// Forgets a job wherever it is, stopping it first if it is running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::JobNotFound`] for an unknown id.
    pub async fn remove(&self, id: JobId) -> Result<()> {
        self.request(|reply| Command::Remove(id, reply)).await?
    }

    /// Subscribes to live snapshots. The current state arrives first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineStopped`] if the engine is gone.
    pub async fn subscribe(&self) -> Result<SnapshotReceiver> {
        self.request(Command::Subscribe).await
    }

    /// Cancels running jobs, writes the state file and stops the engine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineStopped`] if the engine was already gone.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }
}

/// Configures and starts an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    state_file: Option<PathBuf>,
    strategies: HashMap<JobKind, Arc<dyn FetchStrategy>>,
    torrent_session: Option<Arc<dyn TorrentSession>>,
}

impl EngineBuilder {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state_file: None,
            strategies: HashMap::new(),
            torrent_session: None,
        }
    }

    /// Persists the queue to `path` and restores it from there at start.
    #[must_use]
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    /// Replaces the strategy used for one job kind.
    #[must_use]
    pub fn with_strategy(mut self, kind: JobKind, strategy: Arc<dyn FetchStrategy>) -> Self {
        self.strategies.insert(kind, strategy);
        self
    }

    /// Installs the embedded torrent engine used when
    /// `torrent_backend = "embedded"`.
    #[must_use]
    pub fn with_torrent_session(mut self, session: Arc<dyn TorrentSession>) -> Self {
        self.torrent_session = Some(session);
        self
    }

    /// Restores state and spawns the dispatcher on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if a default strategy cannot be constructed.
    pub fn spawn(mut self) -> Result<Engine> {
        let torrent: Arc<dyn FetchStrategy> =
            Arc::new(TorrentStrategy::new(self.torrent_session.take()));
        let media: Arc<dyn FetchStrategy> = match self.strategies.remove(&JobKind::Media) {
            Some(strategy) => strategy,
            None => Arc::new(MediaStrategy::new()),
        };
        let file: Arc<dyn FetchStrategy> = match self.strategies.remove(&JobKind::File) {
            Some(strategy) => strategy,
            None => Arc::new(FileStrategy::new()?),
        };
        let strategies = Strategies {
            media,
            file,
            torrent: self
                .strategies
                .remove(&JobKind::Torrent)
                .unwrap_or_else(|| Arc::clone(&torrent)),
            magnet: self.strategies.remove(&JobKind::Magnet).unwrap_or(torrent),
        };

        let store = self.state_file.as_deref().map_or_else(
            || QueueStore::new(self.config.max_concurrent, self.config.history_limit),
            |path| restore(path, &self.config),
        );
        let writer = self
            .state_file
            .map(|path| StateWriter::spawn(path, self.config.persist_debounce()));

        let (tx, commands) = mpsc::unbounded_channel();
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let (internal_tx, internal) = mpsc::unbounded_channel();

        let mut dispatcher = Dispatcher {
            broadcaster: Broadcaster::new(self.config.broadcast_interval()),
            config: Arc::new(self.config),
            store,
            strategies,
            writer,
            reports_tx,
            internal_tx,
            retry_timers: HashMap::new(),
            jobs_token: CancellationToken::new(),
            scanning: false,
        };
        dispatcher.start_resume_scan();
        tokio::spawn(dispatcher.run(commands, reports, internal));
        Ok(Engine { tx })
    }
}

fn restore(path: &std::path::Path, config: &EngineConfig) -> QueueStore {
    match persist::load(path) {
        LoadOutcome::Loaded(state) => {
            let store = state.into_store(config.history_limit);
            log::info!(
                "Restored {} queued and {} finished jobs from {}",
                store.queued().len(),
                store.history().count(),
                path.display()
            );
            store
        }
        LoadOutcome::Missing => {
            log::info!("No state file at {}, starting empty", path.display());
            QueueStore::new(config.max_concurrent, config.history_limit)
        }
        LoadOutcome::Quarantined(moved) => {
            log::warn!("Starting empty; previous state kept at {}", moved.display());
            QueueStore::new(config.max_concurrent, config.history_limit)
        }
    }
}

struct Strategies {
    media: Arc<dyn FetchStrategy>,
    file: Arc<dyn FetchStrategy>,
    torrent: Arc<dyn FetchStrategy>,
    magnet: Arc<dyn FetchStrategy>,
}

impl Strategies {
    fn for_kind(&self, kind: JobKind) -> Arc<dyn FetchStrategy> {
        Arc::clone(match kind {
            JobKind::Media => &self.media,
            JobKind::File => &self.file,
            JobKind::Torrent => &self.torrent,
            JobKind::Magnet => &self.magnet,
        })
    }
}

struct Dispatcher {
    store: QueueStore,
    config: Arc<EngineConfig>,
    strategies: Strategies,
    broadcaster: Broadcaster,
    writer: Option<StateWriter>,
    reports_tx: mpsc::UnboundedSender<Report>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    retry_timers: HashMap<JobId, CancellationToken>,
    /// Parent of every job and retry-timer token.
    jobs_token: CancellationToken,
    /// Promotion waits until restored jobs have been checked against disk.
    scanning: bool,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut reports: mpsc::UnboundedReceiver<Report>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut tick = tokio::time::interval(self.config.broadcast_interval().max(MIN_TICK));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.promote();
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown(&mut internal).await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        log::info!("All engine handles dropped");
                        self.shutdown(&mut internal).await;
                        return;
                    }
                },
                Some(report) = reports.recv() => self.handle_report(report),
                Some(event) = internal.recv() => self.handle_internal(event),
                _ = tick.tick(), if self.broadcaster.is_pending() => {
                    self.broadcaster.flush_pending(&self.store);
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit(submission, reply) => {
                let _ = reply.send(self.submit(submission));
            }
            Command::Inspect(reply) => {
                let _ = reply.send(self.store.snapshot());
            }
            Command::SetEnabled(enabled, reply) => {
                self.set_enabled(enabled);
                let _ = reply.send(());
            }
            Command::SetMaxConcurrent(max, reply) => {
                self.store.set_max_concurrent(max);
                log::info!("Concurrency limit set to {}", self.store.max_concurrent());
                self.commit(Urgency::Immediate);
                self.promote();
                let _ = reply.send(());
            }
            Command::Cancel(id, reply) => {
                let _ = reply.send(self.cancel(id));
            }
            Command::Reorder { from, to, reply } => {
                let result = self.store.reorder(from, to);
                if result.is_ok() {
                    log::debug!("Moved queue position {from} to {to}");
                    self.commit(Urgency::Immediate);
                }
                let _ = reply.send(result);
            }
            Command::Retry(id, reply) => {
                let _ = reply.send(self.retry(id));
            }
            Command::RetryAllFailed(reply) => {
                let ids = self.store.failed_ids();
                for &id in &ids {
                    if let Some(job) = self.store.take_history(id) {
                        self.requeue(job);
                    }
                }
                if !ids.is_empty() {
                    log::info!("Re-queued {} failed jobs", ids.len());
                    self.commit(Urgency::Immediate);
                    self.promote();
                }
                let _ = reply.send(ids.len());
            }
            Command::ClearCompleted(reply) => {
                let cleared = self.store.clear_completed();
                if cleared > 0 {
                    self.commit(Urgency::Immediate);
                }
                let _ = reply.send(cleared);
            }
            Command::Remove(id, reply) => {
                let _ = reply.send(self.remove(id));
            }
            Command::Subscribe(reply) => {
                let _ = reply.send(self.broadcaster.subscribe(&self.store));
            }
            // Handled by the run loop.
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    /// Persists the store and tells observers.
    fn commit(&mut self, urgency: Urgency) {
        if let Some(writer) = &self.writer {
            writer.schedule(StateFile::capture(&self.store));
        }
        self.broadcaster.notify(&self.store, urgency);
    }

    fn submit(&mut self, submission: Submission) -> Result<JobId> {
        let url = submission.url.trim();
        let kind = classify(url, &submission.hint)?;
        let title = submission
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| derive_title(url));

        let id = self.store.allocate_id();
        let details = JobDetails::for_kind(kind, submission.format_hint);
        log::info!("Queued job {id} ({kind}): {title}");
        self.store
            .enqueue(Job::new(id, url.to_string(), title, details));
        self.commit(Urgency::Immediate);
        self.promote();
        Ok(id)
    }

    fn set_enabled(&mut self, enabled: bool) {
        if self.store.is_enabled() == enabled {
            return;
        }
        self.store.set_enabled(enabled);
        log::info!("Queue {}", if enabled { "resumed" } else { "paused" });
        self.commit(Urgency::Immediate);
        self.promote();
    }

    /// Promotes as many queued jobs as the budgets allow.
    fn promote(&mut self) {
        if !self.store.is_enabled() || self.scanning {
            return;
        }
        let budget = Budget {
            max_concurrent: self.store.max_concurrent(),
            active: self.store.active_count(),
            active_torrents: self.store.active_torrent_count(),
        };
        let ids = plan_promotions(self.store.queued(), budget);
        if ids.is_empty() {
            return;
        }
        for id in ids {
            self.dispatch(id);
        }
        self.commit(Urgency::Immediate);
    }

    fn dispatch(&mut self, id: JobId) {
        let token = self.jobs_token.child_token();
        let Some(job) = self.store.promote(id, token.clone()) else {
            return;
        };
        let mut job = job.clone();
        job.handle = None;
        log::info!("Starting job {id} ({}): {}", job.kind(), job.title);

        let strategy = self.strategies.for_kind(job.kind());
        let ctx = FetchContext {
            job,
            config: Arc::clone(&self.config),
            reporter: JobReporter::new(id, self.reports_tx.clone(), self.config.progress_interval()),
            cancel: token,
        };
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let outcome = match tokio::spawn(async move { strategy.fetch(ctx).await }).await {
                Ok(outcome) => outcome,
                Err(e) => FetchOutcome::Failed(FetchFailure::new(
                    FailureClass::Transient,
                    format!("Fetch task failed: {e}"),
                )),
            };
            let _ = tx.send(Internal::Finished { id, outcome });
        });
    }

    fn handle_report(&mut self, Report { id, event }: Report) {
        // Reports from a job that was cancelled or removed are stale.
        let Some(job) = self.store.active_mut(id) else {
            return;
        };
        match event {
            StrategyEvent::Progress(update) => {
                let mut urgency = Urgency::Throttled;
                if job.status == JobStatus::Starting {
                    job.status = JobStatus::Downloading;
                    log::info!("Job {id} downloading");
                    urgency = Urgency::Immediate;
                }
                let changed = progress::apply(job, &update);
                log::trace!("Job {id}: {:.1}%", job.progress);
                if changed || urgency == Urgency::Immediate {
                    self.broadcaster.notify(&self.store, urgency);
                }
            }
            StrategyEvent::Status(status) => {
                if job.status == status || !job.status.can_transition_to(status) {
                    return;
                }
                log::info!("Job {id} {status}");
                job.status = status;
                self.commit(Urgency::Immediate);
            }
            StrategyEvent::Output(path) => {
                let path = path.to_string_lossy().into_owned();
                if job.output.as_deref() != Some(path.as_str()) {
                    log::debug!("Job {id} writes {path}");
                    job.output = Some(path);
                    self.commit(Urgency::Throttled);
                }
            }
        }
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Finished { id, outcome } => self.finish(id, outcome),
            Internal::RetryDue(id) => {
                self.retry_timers.remove(&id);
                if let Some(mut job) = self.store.take_retrying(id) {
                    log::info!("Job {id} re-queued (attempt {})", job.retry_count + 1);
                    job.reset_transient();
                    self.store.enqueue(job);
                    self.commit(Urgency::Immediate);
                    self.promote();
                }
            }
            Internal::Scanned(report) => self.apply_scan(&report),
        }
    }

    fn finish(&mut self, id: JobId, outcome: FetchOutcome) {
        // A job cancelled or removed while running has already left the active set.
        let Some(mut job) = self.store.take_active(id) else {
            log::debug!("Job {id} finished after leaving the active set");
            return;
        };
        job.speed = None;
        job.eta = None;

        match outcome {
            FetchOutcome::Completed => {
                log::info!("Job {id} completed: {}", job.title);
                job.status = JobStatus::Completed;
                job.progress = 100.0;
                job.error = None;
                job.diagnostic = None;
                job.completed_at = Some(Utc::now());
                self.store.push_history(job);
            }
            FetchOutcome::Cancelled => {
                log::info!("Job {id} cancelled");
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(Utc::now());
                self.store.push_history(job);
            }
            FetchOutcome::Reclassify { kind, metainfo } => {
                log::info!("Job {id} re-classified from {} to {kind}", job.kind());
                job.details = match kind {
                    JobKind::Torrent => JobDetails::Torrent {
                        metainfo: metainfo.map(|p| p.to_string_lossy().into_owned()),
                        swarm: SwarmStats::default(),
                    },
                    other => JobDetails::for_kind(other, None),
                };
                job.output = None;
                job.reset_transient();
                self.store.enqueue_front(job);
            }
            FetchOutcome::Failed(failure) => self.fail(job, failure),
        }
        self.commit(Urgency::Immediate);
        self.promote();
    }

    fn fail(&mut self, mut job: Job, failure: FetchFailure) {
        let id = job.id;
        if let Some(diagnostic) = &failure.diagnostic {
            log::debug!("Job {id} tool errors:\n{diagnostic}");
        }
        job.error = Some(failure.message.clone());
        job.diagnostic = failure.diagnostic;

        if failure.class.is_retryable() && job.retry_count < self.config.max_retries {
            job.retry_count += 1;
            let delay = self.config.retry_delay();
            log::warn!(
                "Job {id} failed ({}), retry {}/{} in {}",
                failure.message,
                job.retry_count,
                self.config.max_retries,
                format_duration(delay)
            );
            self.start_retry_timer(id, delay);
            self.store.hold_retrying(job);
        } else {
            log::error!("Job {id} failed: {}", failure.message);
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            self.store.push_history(job);
        }
    }

    fn start_retry_timer(&mut self, id: JobId, delay: Duration) {
        let token = self.jobs_token.child_token();
        self.retry_timers.insert(id, token.clone());
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    let _ = tx.send(Internal::RetryDue(id));
                }
            }
        });
    }

    fn stop_retry_timer(&mut self, id: JobId) {
        if let Some(token) = self.retry_timers.remove(&id) {
            token.cancel();
        }
    }

    /// Takes a job out of whichever collection holds it, stopping its
    /// process or timer.
    fn detach(&mut self, id: JobId) -> Option<(Location, Job)> {
        let (location, _) = self.store.find(id)?;
        let job = match location {
            Location::Queued => self.store.take_queued(id),
            Location::Active => {
                let handle = self
                    .store
                    .active_mut(id)
                    .and_then(|job| job.handle.clone());
                if let Some(handle) = handle {
                    handle.cancel();
                }
                self.store.take_active(id)
            }
            Location::Retrying => {
                self.stop_retry_timer(id);
                self.store.take_retrying(id)
            }
            Location::History => self.store.take_history(id),
        }?;
        Some((location, job))
    }

    fn cancel(&mut self, id: JobId) -> Result<()> {
        match self.store.find(id) {
            None => return Err(Error::JobNotFound(id)),
            Some((Location::History, _)) => return Ok(()),
            Some((Location::Queued, _)) => {
                self.store.cancel_queued(id);
            }
            Some(_) => {
                if let Some((_, mut job)) = self.detach(id) {
                    job.status = JobStatus::Cancelled;
                    job.speed = None;
                    job.eta = None;
                    job.completed_at = Some(Utc::now());
                    self.store.push_history(job);
                }
            }
        }
        log::info!("Job {id} cancelled");
        self.commit(Urgency::Immediate);
        self.promote();
        Ok(())
    }

    fn remove(&mut self, id: JobId) -> Result<()> {
        let (location, job) = self.detach(id).ok_or(Error::JobNotFound(id))?;
        log::info!("Removed job {id} ({}): {}", job.status, job.title);
        self.commit(Urgency::Immediate);
        if location == Location::Active {
            self.promote();
        }
        Ok(())
    }

    fn retry(&mut self, id: JobId) -> Result<()> {
        let (location, job) = self.store.find(id).ok_or(Error::JobNotFound(id))?;
        let status = job.status;
        let job = match (location, status) {
            (Location::History, JobStatus::Failed | JobStatus::Cancelled) => {
                self.store.take_history(id)
            }
            (Location::Retrying, _) => {
                self.stop_retry_timer(id);
                self.store.take_retrying(id)
            }
            _ => return Err(Error::NotRetryable { id, status }),
        };
        if let Some(job) = job {
            log::info!("Job {id} re-queued by request");
            self.requeue(job);
            self.commit(Urgency::Immediate);
            self.promote();
        }
        Ok(())
    }

    /// Queues a job again with a fresh retry budget.
    fn requeue(&mut self, mut job: Job) {
        job.retry_count = 0;
        job.error = None;
        job.diagnostic = None;
        job.reset_transient();
        self.store.enqueue(job);
    }

    /// Checks restored jobs' outputs on disk off the control timeline.
    fn start_resume_scan(&mut self) {
        let targets: Vec<(JobId, PathBuf)> = self
            .store
            .queued()
            .iter()
            .filter_map(|job| job.output.as_ref().map(|out| (job.id, PathBuf::from(out))))
            .collect();
        if targets.is_empty() {
            return;
        }
        self.scanning = true;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let report = ResumeScanner::new().scan(targets).await;
            let _ = tx.send(Internal::Scanned(report));
        });
    }

    fn apply_scan(&mut self, report: &ScanReport) {
        self.scanning = false;
        for &id in &report.completed {
            if let Some(mut job) = self.store.take_queued(id) {
                log::info!("Job {id} already complete on disk");
                job.status = JobStatus::Completed;
                job.progress = 100.0;
                job.completed_at = Some(Utc::now());
                self.store.push_history(job);
            }
        }
        if !report.partial.is_empty() {
            log::info!("{} jobs will continue from partial files", report.partial.len());
        }
        self.commit(Urgency::Immediate);
        self.promote();
    }

    /// Stops every job, waits briefly for strategies to release their tools,
    /// then writes the final state. Jobs still marked active are stored as
    /// in-flight and re-queued on the next start.
    async fn shutdown(mut self, internal: &mut mpsc::UnboundedReceiver<Internal>) {
        let active = self.store.active_count();
        log::info!("Shutting down ({active} active jobs)");
        self.jobs_token.cancel();

        let mut waiting = active;
        let deadline = Instant::now() + self.config.kill_grace() + SHUTDOWN_SLACK;
        while waiting > 0 {
            tokio::select! {
                () = sleep_until(deadline) => {
                    log::warn!("{waiting} jobs did not stop in time");
                    break;
                }
                event = internal.recv() => match event {
                    Some(Internal::Finished { .. }) => waiting -= 1,
                    Some(_) => {}
                    None => break,
                },
            }
        }

        if let Some(writer) = self.writer.take() {
            writer.schedule(StateFile::capture(&self.store));
            writer.close().await;
        }
    }
}

#[cfg(test)]
mod tests;
