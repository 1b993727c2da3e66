use super::*;

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::classify::ResolutionHint;
use crate::config::TorrentBackend;
use crate::fetch::{TorrentEvent, TorrentFile, TorrentHandle, TorrentProgress, TorrentSource};
use crate::progress::ProgressUpdate;

/// A running mock fetch, finished by the test.
struct Started {
    id: JobId,
    kind: JobKind,
    reporter: JobReporter,
    finish: oneshot::Sender<FetchOutcome>,
}

impl Started {
    fn finish(self, outcome: FetchOutcome) {
        let _ = self.finish.send(outcome);
    }
}

/// Hands every dispatched job to the test and waits for its outcome.
struct Controlled {
    tx: mpsc::UnboundedSender<Started>,
}

#[async_trait]
impl FetchStrategy for Controlled {
    async fn fetch(&self, ctx: FetchContext) -> FetchOutcome {
        let (finish, rx) = oneshot::channel();
        let _ = self.tx.send(Started {
            id: ctx.job.id,
            kind: ctx.job.kind(),
            reporter: ctx.reporter,
            finish,
        });
        tokio::select! {
            () = ctx.cancel.cancelled() => FetchOutcome::Cancelled,
            outcome = rx => outcome.unwrap_or(FetchOutcome::Cancelled),
        }
    }
}

fn builder(config: EngineConfig) -> (EngineBuilder, mpsc::UnboundedReceiver<Started>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let controlled: Arc<dyn FetchStrategy> = Arc::new(Controlled { tx });
    let mut builder = EngineBuilder::new(config);
    for kind in [JobKind::Media, JobKind::File, JobKind::Torrent, JobKind::Magnet] {
        builder = builder.with_strategy(kind, Arc::clone(&controlled));
    }
    (builder, rx)
}

fn engine(config: EngineConfig) -> (Engine, mpsc::UnboundedReceiver<Started>) {
    let (builder, rx) = builder(config);
    (builder.spawn().unwrap(), rx)
}

fn config() -> EngineConfig {
    EngineConfig::default()
        .with_download_dir("/downloads")
        .with_retry_delay_secs(5)
}

fn media(n: u32) -> Submission {
    Submission::new(format!("https://video.example.com/watch/{n}"))
}

fn magnet(n: u32) -> Submission {
    Submission::new(format!("magnet:?xt=urn:btih:{n:040}&dn=item{n}"))
}

async fn wait_for(engine: &Engine, what: &str, pred: impl Fn(&QueueSnapshot) -> bool) -> QueueSnapshot {
    for _ in 0..2000 {
        let snapshot = engine.inspect().await.unwrap();
        if pred(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}

fn ids(jobs: &[Job]) -> Vec<JobId> {
    jobs.iter().map(|j| j.id).collect()
}

fn failure(class: FailureClass, message: &str) -> FetchOutcome {
    FetchOutcome::Failed(FetchFailure::new(class, message))
}

#[tokio::test]
async fn promotes_up_to_max_concurrent() {
    let (engine, mut started) = engine(config().with_max_concurrent(2));
    for n in 0..4 {
        engine.submit(media(n)).await.unwrap();
    }

    let first = started.recv().await.unwrap();
    let second = started.recv().await.unwrap();
    assert_eq!((first.id, second.id), (1, 2));

    let snapshot = engine.inspect().await.unwrap();
    assert_eq!(ids(&snapshot.active), vec![1, 2]);
    assert_eq!(ids(&snapshot.queued), vec![3, 4]);
    assert!(snapshot.active.iter().all(|j| j.status == JobStatus::Starting));
    assert!(started.try_recv().is_err());

    first.finish(FetchOutcome::Completed);
    let third = started.recv().await.unwrap();
    assert_eq!(third.id, 3);

    let snapshot = wait_for(&engine, "history", |s| s.completed_history.len() == 1).await;
    assert_eq!(snapshot.completed_history[0].status, JobStatus::Completed);
    assert!((snapshot.completed_history[0].progress - 100.0).abs() < f64::EPSILON);
    assert_eq!(snapshot.stats.active_count, 2);
}

#[tokio::test]
async fn torrent_cap_lets_other_jobs_pass() {
    let (engine, mut started) = engine(config().with_max_concurrent(5));
    for n in 0..3 {
        engine.submit(magnet(n)).await.unwrap();
    }
    let media_id = engine.submit(media(9)).await.unwrap();

    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(started.recv().await.unwrap());
    }
    let kinds: Vec<_> = held.iter().map(|s| (s.id, s.kind)).collect();
    assert_eq!(
        kinds,
        vec![(1, JobKind::Magnet), (2, JobKind::Magnet), (media_id, JobKind::Media)]
    );

    let snapshot = engine.inspect().await.unwrap();
    assert_eq!(ids(&snapshot.queued), vec![3]);
    assert_eq!(
        snapshot.active.iter().filter(|j| j.kind().is_torrent()).count(),
        2
    );
}

#[tokio::test]
async fn paused_queue_holds_jobs() {
    let (engine, mut started) = engine(config());
    engine.pause().await.unwrap();
    engine.submit(media(1)).await.unwrap();

    let snapshot = engine.inspect().await.unwrap();
    assert!(!snapshot.queue_enabled);
    assert_eq!(snapshot.queued.len(), 1);
    assert!(started.try_recv().is_err());

    engine.resume().await.unwrap();
    assert_eq!(started.recv().await.unwrap().id, 1);
}

#[tokio::test]
async fn zero_concurrency_config_still_runs_one_job() {
    let (engine, mut started) = engine(config().with_max_concurrent(0));
    engine.submit(media(1)).await.unwrap();
    engine.submit(media(2)).await.unwrap();

    assert_eq!(started.recv().await.unwrap().id, 1);
    let snapshot = engine.inspect().await.unwrap();
    assert_eq!(snapshot.max_concurrent, 1);
    assert_eq!(ids(&snapshot.queued), vec![2]);
}

#[tokio::test]
async fn progress_moves_job_to_downloading() {
    let (engine, mut started) = engine(config());
    engine.submit(media(1)).await.unwrap();
    let mut job = started.recv().await.unwrap();

    job.reporter.progress(crate::progress::parse_line(
        "[download]  42.0% of 10MiB at 1.2MiB/s ETA 00:08",
    ));
    let snapshot = wait_for(&engine, "downloading", |s| {
        s.active.first().is_some_and(|j| j.status == JobStatus::Downloading)
    })
    .await;
    let active = &snapshot.active[0];
    assert!((active.progress - 42.0).abs() < f64::EPSILON);
    assert_eq!(active.speed.as_deref(), Some("1.2MiB/s"));
    assert_eq!(active.size.as_deref(), Some("10MiB"));

    job.reporter.status(JobStatus::Processing);
    wait_for(&engine, "processing", |s| {
        s.active.first().is_some_and(|j| j.status == JobStatus::Processing)
    })
    .await;
    job.finish(FetchOutcome::Completed);
}

#[tokio::test]
async fn cancelling_queued_job_leaves_others_alone() {
    let (engine, _started) = engine(config());
    engine.pause().await.unwrap();
    for n in 0..3 {
        engine.submit(media(n)).await.unwrap();
    }
    let before = engine.inspect().await.unwrap();

    engine.cancel(2).await.unwrap();
    let after = engine.inspect().await.unwrap();
    assert_eq!(ids(&after.queued), vec![1, 3]);
    assert_eq!(after.queued[0].status, before.queued[0].status);
    assert_eq!(after.queued[1].status, before.queued[2].status);
    assert_eq!(after.completed_history[0].id, 2);
    assert_eq!(after.completed_history[0].status, JobStatus::Cancelled);
}

#[tokio::test]
async fn cancelling_active_job_backfills_slot() {
    let (engine, mut started) = engine(config().with_max_concurrent(1));
    engine.submit(media(1)).await.unwrap();
    engine.submit(media(2)).await.unwrap();
    let mut first = started.recv().await.unwrap();

    engine.cancel(first.id).await.unwrap();
    let second = started.recv().await.unwrap();
    assert_eq!(second.id, 2);

    let snapshot = engine.inspect().await.unwrap();
    assert_eq!(ids(&snapshot.active), vec![2]);
    assert_eq!(snapshot.completed_history[0].status, JobStatus::Cancelled);
    // The strategy saw the cancellation and returned.
    first.finish.closed().await;
}

#[tokio::test(start_paused = true)]
async fn transient_failure_retries_after_delay() {
    let (engine, mut started) = engine(config().with_max_retries(1));
    engine.submit(media(1)).await.unwrap();

    started
        .recv()
        .await
        .unwrap()
        .finish(failure(FailureClass::Transient, "connection reset"));
    let snapshot = wait_for(&engine, "retrying", |s| s.retrying.len() == 1).await;
    let retrying = &snapshot.retrying[0];
    assert_eq!(retrying.status, JobStatus::Retrying);
    assert_eq!(retrying.retry_count, 1);
    assert_eq!(retrying.error.as_deref(), Some("connection reset"));
    assert_eq!(snapshot.stats.active_count, 0);

    let waited = Instant::now();
    let again = started.recv().await.unwrap();
    assert_eq!(again.id, 1);
    assert!(waited.elapsed() >= Duration::from_secs(4));

    again.finish(failure(FailureClass::Transient, "connection reset again"));
    let snapshot = wait_for(&engine, "failed", |s| !s.completed_history.is_empty()).await;
    let failed = &snapshot.completed_history[0];
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.retry_count, 1);
    assert_eq!(failed.error.as_deref(), Some("connection reset again"));
    assert_eq!(snapshot.stats.failed_count, 1);
}

#[tokio::test]
async fn access_failure_is_not_retried() {
    let (engine, mut started) = engine(config());
    engine.submit(media(1)).await.unwrap();
    started.recv().await.unwrap().finish(FetchOutcome::Failed(
        FetchFailure::new(FailureClass::Access, "Access denied: sign in")
            .with_diagnostic("ERROR: Sign in to confirm"),
    ));

    let snapshot = wait_for(&engine, "failed", |s| !s.completed_history.is_empty()).await;
    let failed = &snapshot.completed_history[0];
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.retry_count, 0);
    assert_eq!(failed.error.as_deref(), Some("Access denied: sign in"));
    assert!(snapshot.retrying.is_empty());
}

#[tokio::test]
async fn torrent_payload_reclassifies_without_failing() {
    let (engine, mut started) = engine(config().with_max_concurrent(1));
    let hint = ResolutionHint {
        resolved_method: Some("aria2".to_string()),
        ..ResolutionHint::default()
    };
    let id = engine
        .submit(Submission::new("https://files.example.com/get?id=7").with_hint(hint))
        .await
        .unwrap();
    engine.submit(media(2)).await.unwrap();

    let first = started.recv().await.unwrap();
    assert_eq!((first.id, first.kind), (id, JobKind::File));
    first.finish(FetchOutcome::Reclassify {
        kind: JobKind::Torrent,
        metainfo: Some(PathBuf::from("/downloads/get")),
    });

    // Re-queued at the front, so it runs before the media job.
    let second = started.recv().await.unwrap();
    assert_eq!((second.id, second.kind), (id, JobKind::Torrent));

    let snapshot = engine.inspect().await.unwrap();
    assert!(snapshot.completed_history.is_empty());
    let job = &snapshot.active[0];
    assert_eq!(job.retry_count, 0);
    assert_eq!(
        job.details,
        JobDetails::Torrent {
            metainfo: Some("/downloads/get".to_string()),
            swarm: SwarmStats::default(),
        }
    );
}

#[tokio::test]
async fn submission_errors() {
    let (engine, _started) = engine(config());
    assert!(matches!(
        engine.submit(Submission::new("   ")).await,
        Err(Error::EmptyUrl)
    ));
    assert!(matches!(
        engine.submit(Submission::new("gopher://old.example.com/x")).await,
        Err(Error::Classification { .. })
    ));
    assert!(engine.inspect().await.unwrap().queued.is_empty());
}

#[tokio::test]
async fn titles_are_derived_when_missing() {
    let (engine, _started) = engine(config());
    engine.pause().await.unwrap();
    engine.submit(magnet(1)).await.unwrap();
    engine
        .submit(media(2).with_title("  My clip  "))
        .await
        .unwrap();
    let snapshot = engine.inspect().await.unwrap();
    assert_eq!(snapshot.queued[0].title, "item1");
    assert_eq!(snapshot.queued[1].title, "My clip");
}

#[tokio::test]
async fn reorder_checks_bounds() {
    let (engine, _started) = engine(config());
    engine.pause().await.unwrap();
    for n in 0..3 {
        engine.submit(media(n)).await.unwrap();
    }
    engine.reorder(2, 0).await.unwrap();
    assert_eq!(ids(&engine.inspect().await.unwrap().queued), vec![3, 1, 2]);

    assert!(matches!(
        engine.reorder(0, 3).await,
        Err(Error::InvalidReorder { from: 0, to: 3 })
    ));
    assert_eq!(ids(&engine.inspect().await.unwrap().queued), vec![3, 1, 2]);
}

#[tokio::test]
async fn retry_clear_and_remove() {
    let (engine, mut started) = engine(config().with_max_retries(0));
    engine.submit(media(1)).await.unwrap();
    engine.submit(media(2)).await.unwrap();
    engine.submit(media(3)).await.unwrap();

    let mut running = Vec::new();
    for _ in 0..3 {
        running.push(started.recv().await.unwrap());
    }
    let mut running = running.into_iter();
    running
        .next()
        .unwrap()
        .finish(failure(FailureClass::Unsupported, "Unsupported URL"));
    running
        .next()
        .unwrap()
        .finish(failure(FailureClass::Transient, "timed out"));
    running.next().unwrap().finish(FetchOutcome::Completed);
    wait_for(&engine, "three finished", |s| s.completed_history.len() == 3).await;

    assert!(matches!(
        engine.retry(3).await,
        Err(Error::NotRetryable { id: 3, status: JobStatus::Completed })
    ));
    assert!(matches!(engine.retry(99).await, Err(Error::JobNotFound(99))));

    engine.pause().await.unwrap();
    engine.retry(1).await.unwrap();
    let snapshot = engine.inspect().await.unwrap();
    assert_eq!(ids(&snapshot.queued), vec![1]);
    assert!(snapshot.queued[0].error.is_none());

    assert_eq!(engine.retry_all_failed().await.unwrap(), 1);
    assert_eq!(ids(&engine.inspect().await.unwrap().queued), vec![1, 2]);

    assert_eq!(engine.clear_completed().await.unwrap(), 1);
    assert!(engine.inspect().await.unwrap().completed_history.is_empty());

    engine.remove(2).await.unwrap();
    assert_eq!(ids(&engine.inspect().await.unwrap().queued), vec![1]);
    assert!(matches!(engine.remove(2).await, Err(Error::JobNotFound(2))));
}

#[tokio::test]
async fn removing_active_job_frees_slot() {
    let (engine, mut started) = engine(config().with_max_concurrent(1));
    engine.submit(media(1)).await.unwrap();
    engine.submit(media(2)).await.unwrap();
    let _first = started.recv().await.unwrap();

    engine.remove(1).await.unwrap();
    assert_eq!(started.recv().await.unwrap().id, 2);
    let snapshot = engine.inspect().await.unwrap();
    assert!(snapshot.completed_history.is_empty());
    assert_eq!(ids(&snapshot.active), vec![2]);
}

#[tokio::test]
async fn lowering_concurrency_does_not_stop_running_jobs() {
    let (engine, mut started) = engine(config().with_max_concurrent(2));
    for n in 0..3 {
        engine.submit(media(n)).await.unwrap();
    }
    let first = started.recv().await.unwrap();
    let _second = started.recv().await.unwrap();

    engine.set_max_concurrent(0).await.unwrap();
    let snapshot = engine.inspect().await.unwrap();
    assert_eq!(snapshot.max_concurrent, 1);
    assert_eq!(snapshot.active.len(), 2);

    first.finish(FetchOutcome::Completed);
    wait_for(&engine, "first done", |s| s.completed_history.len() == 1).await;
    assert!(started.try_recv().is_err());
}

#[tokio::test]
async fn subscribers_get_initial_and_live_snapshots() {
    let (engine, _started) = engine(config());
    engine.pause().await.unwrap();
    let mut rx = engine.subscribe().await.unwrap();

    let initial = rx.recv().await.unwrap();
    assert!(initial.queued.is_empty());
    assert!(!initial.queue_enabled);

    engine.submit(media(1)).await.unwrap();
    let next = rx.recv().await.unwrap();
    assert_eq!(ids(&next.queued), vec![1]);
}

#[tokio::test]
async fn stopped_engine_reports_it() {
    let (engine, _started) = engine(config());
    engine.shutdown().await.unwrap();
    assert!(matches!(engine.inspect().await, Err(Error::EngineStopped)));
    assert!(matches!(
        engine.submit(media(1)).await,
        Err(Error::EngineStopped)
    ));
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");

    let (setup, mut started) = builder(config().with_max_concurrent(2));
    let engine = setup.with_state_file(&state).spawn().unwrap();
    let active = engine.submit(media(1)).await.unwrap();
    let failed = engine
        .submit(media(2).with_title("broken"))
        .await
        .unwrap();

    let a = started.recv().await.unwrap();
    let b = started.recv().await.unwrap();
    let (mut a, b) = if a.id == active { (a, b) } else { (b, a) };
    a.reporter
        .progress(crate::progress::parse_line("[download]  40.0% of 1MiB"));
    wait_for(&engine, "downloading", |s| {
        s.active.iter().any(|j| j.status == JobStatus::Downloading)
    })
    .await;
    b.finish(failure(FailureClass::Access, "Access denied: private video"));
    wait_for(&engine, "failed", |s| s.stats.failed_count == 1).await;

    engine.pause().await.unwrap();
    engine.shutdown().await.unwrap();
    drop(a);
    assert!(state.exists());

    let (setup, mut started) = builder(config());
    let engine = setup.with_state_file(&state).spawn().unwrap();
    let snapshot = engine.inspect().await.unwrap();
    assert!(!snapshot.queue_enabled);
    assert_eq!(snapshot.max_concurrent, 2);

    assert_eq!(ids(&snapshot.queued), vec![active]);
    let restored = &snapshot.queued[0];
    assert_eq!(restored.status, JobStatus::Queued);
    assert!(restored.progress.abs() < f64::EPSILON);
    assert!(restored.speed.is_none());

    let history = &snapshot.completed_history[0];
    assert_eq!(history.id, failed);
    assert_eq!(history.title, "broken");
    assert_eq!(history.status, JobStatus::Failed);
    assert_eq!(history.error.as_deref(), Some("Access denied: private video"));

    // New ids continue after the restored ones.
    assert_eq!(engine.submit(media(3)).await.unwrap(), 3);
    assert!(started.try_recv().is_err());
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn restored_jobs_are_checked_against_disk() {
    let dir = tempfile::tempdir().unwrap();
    let done = dir.path().join("done.iso");
    std::fs::write(&done, b"complete payload").unwrap();
    let partial = dir.path().join("partial.iso");
    std::fs::write(&partial, b"half").unwrap();
    std::fs::write(dir.path().join("partial.iso.aria2"), b"control").unwrap();

    let job = |id: JobId, output: &Path| {
        let mut job = Job::new(
            id,
            format!("https://files.example.com/{id}"),
            format!("file {id}"),
            JobDetails::for_kind(JobKind::File, None),
        );
        job.progress = 60.0;
        job.output = Some(output.to_string_lossy().into_owned());
        job
    };
    let mut store = QueueStore::new(3, 50);
    store.bump_next_id(3);
    store.set_enabled(false);
    store.enqueue(job(1, &done));
    store.enqueue(job(2, &partial));
    let state = dir.path().join("state.json");
    persist::save(&state, &StateFile::capture(&store)).unwrap();

    let (builder, _started) = builder(config());
    let engine = builder.with_state_file(&state).spawn().unwrap();
    let snapshot = wait_for(&engine, "scan", |s| !s.completed_history.is_empty()).await;

    assert_eq!(ids(&snapshot.completed_history), vec![1]);
    assert_eq!(snapshot.completed_history[0].status, JobStatus::Completed);
    assert_eq!(ids(&snapshot.queued), vec![2]);
    assert!(snapshot.queued[0].progress.abs() < f64::EPSILON);
    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn corrupt_state_is_quarantined() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state.json");
    std::fs::write(&state, b"{ not json").unwrap();

    let (builder, _started) = builder(config());
    let engine = builder.with_state_file(&state).spawn().unwrap();
    let snapshot = engine.inspect().await.unwrap();
    assert!(snapshot.queued.is_empty());
    assert!(snapshot.completed_history.is_empty());

    let moved: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("state.json.corrupt-"))
        .collect();
    assert_eq!(moved.len(), 1);
    engine.shutdown().await.unwrap();
}

/// Embedded engine whose torrents resolve metadata and then find no peers.
struct Silent {
    destroyed: Arc<Mutex<usize>>,
}

struct SilentHandle {
    events: std::vec::IntoIter<TorrentEvent>,
    destroyed: Arc<Mutex<usize>>,
}

#[async_trait]
impl TorrentSession for Silent {
    async fn add(
        &self,
        _source: TorrentSource,
        _dir: &Path,
    ) -> std::result::Result<Box<dyn TorrentHandle>, FetchFailure> {
        let events = vec![
            TorrentEvent::Metadata {
                name: "distro".to_string(),
                files: vec![TorrentFile {
                    path: PathBuf::from("distro/disk.iso"),
                    length: 4096,
                }],
            },
            TorrentEvent::Progress(TorrentProgress {
                downloaded: vec![0],
                ..TorrentProgress::default()
            }),
        ];
        Ok(Box::new(SilentHandle {
            events: events.into_iter(),
            destroyed: Arc::clone(&self.destroyed),
        }))
    }
}

#[async_trait]
impl TorrentHandle for SilentHandle {
    async fn next_event(&mut self) -> Option<TorrentEvent> {
        match self.events.next() {
            Some(event) => Some(event),
            None => std::future::pending().await,
        }
    }

    async fn touch(&mut self, _index: usize, _len: u64) {}

    async fn destroy(&mut self) {
        *self.destroyed.lock().unwrap() += 1;
    }
}

#[tokio::test(start_paused = true)]
async fn magnet_without_peers_fails_with_connectivity_error() {
    let destroyed = Arc::new(Mutex::new(0));
    let mut cfg = config()
        .with_torrent_backend(TorrentBackend::Embedded)
        .with_magnet_metadata_timeout_secs(30);
    cfg.torrent_idle_timeout_secs = 60;
    let engine = EngineBuilder::new(cfg)
        .with_torrent_session(Arc::new(Silent {
            destroyed: Arc::clone(&destroyed),
        }))
        .spawn()
        .unwrap();
    let mut rx = engine.subscribe().await.unwrap();

    let id = engine.submit(magnet(1)).await.unwrap();
    let mut seen = Vec::new();
    while let Some(snapshot) = rx.recv().await {
        let status = snapshot
            .active
            .iter()
            .chain(&snapshot.queued)
            .chain(&snapshot.completed_history)
            .find(|j| j.id == id)
            .map(|j| j.status);
        if let Some(status) = status
            && seen.last() != Some(&status)
        {
            seen.push(status);
        }
        if status == Some(JobStatus::Failed) {
            break;
        }
    }
    assert_eq!(
        seen,
        vec![
            JobStatus::Queued,
            JobStatus::Starting,
            JobStatus::Downloading,
            JobStatus::Failed
        ]
    );

    let snapshot = engine.inspect().await.unwrap();
    let failed = &snapshot.completed_history[0];
    assert!(failed.error.as_deref().unwrap().contains("No peers found"));
    assert_eq!(failed.retry_count, 0);
    assert_eq!(*destroyed.lock().unwrap(), 1);
}

#[tokio::test]
async fn reports_for_unknown_jobs_are_ignored() {
    let (engine, mut started) = engine(config());
    engine.submit(media(1)).await.unwrap();
    let mut job = started.recv().await.unwrap();
    engine.cancel(1).await.unwrap();

    job.reporter.progress(ProgressUpdate {
        progress: Some(50.0),
        ..ProgressUpdate::default()
    });
    let snapshot = engine.inspect().await.unwrap();
    assert_eq!(snapshot.completed_history[0].status, JobStatus::Cancelled);
    assert!(snapshot.completed_history[0].progress.abs() < f64::EPSILON);
}
