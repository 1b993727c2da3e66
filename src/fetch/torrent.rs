//! Torrent-file and magnet jobs.
//!
//! Two engines are interchangeable: aria2c as a subprocess, or an embedded
//! streaming engine installed on the engine builder as a [`TorrentSession`].
//! The embedded path is selected by `torrent_backend = "embedded"`; without an
//! installed session the CLI engine is used instead.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use super::diagnose::diagnose;
use super::process::{RunPolicy, ToolCommand, ToolExit, run_tool};
use super::{
    FailureClass, FetchContext, FetchFailure, FetchOutcome, FetchStrategy, JobReporter,
    shows_transfer,
};
use crate::config::{EngineConfig, TorrentBackend};
use crate::format::{format_bytes, format_rate};
use crate::job::{Job, JobDetails, JobKind, JobStatus};
use crate::progress::{ProgressUpdate, parse_line};

/// Files whose first bytes are requested right after metadata arrives.
const TOUCH_FILES: usize = 3;

/// Bytes requested from the start of each touched file.
const TOUCH_BYTES: u64 = 64 * 1024;

static COMPLETE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Download complete: (.+)$").expect("valid regex"));

/// What to hand the torrent engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentSource {
    Magnet(String),
    /// Remote `.torrent` file.
    Url(String),
    /// Local `.torrent` file.
    File(PathBuf),
}

impl TorrentSource {
    #[must_use]
    pub fn for_job(job: &Job) -> Self {
        match &job.details {
            JobDetails::Torrent {
                metainfo: Some(path),
                ..
            } => Self::File(PathBuf::from(path)),
            JobDetails::Magnet { .. } => Self::Magnet(job.url.clone()),
            _ => Self::Url(job.url.clone()),
        }
    }

    fn as_arg(&self) -> String {
        match self {
            Self::Magnet(s) | Self::Url(s) => s.clone(),
            Self::File(p) => p.to_string_lossy().into_owned(),
        }
    }
}

/// One file inside a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub path: PathBuf,
    pub length: u64,
}

/// Counters reported by an embedded engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TorrentProgress {
    /// Downloaded bytes per file, in metadata order.
    pub downloaded: Vec<u64>,
    /// Total uploaded bytes.
    pub uploaded: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub peers: u32,
    pub seeds: Option<u32>,
    /// The engine's own percentage, if it reports one.
    pub percent: Option<f64>,
}

/// Lifecycle events from an embedded engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TorrentEvent {
    /// The file list is known (for magnets, once metadata is resolved).
    Metadata { name: String, files: Vec<TorrentFile> },
    Progress(TorrentProgress),
    Done,
    Error(String),
}

/// An embedded BitTorrent engine.
#[async_trait]
pub trait TorrentSession: Send + Sync {
    /// Starts a torrent that writes into `dir`.
    async fn add(
        &self,
        source: TorrentSource,
        dir: &Path,
    ) -> Result<Box<dyn TorrentHandle>, FetchFailure>;
}

/// A running torrent inside an embedded engine.
#[async_trait]
pub trait TorrentHandle: Send {
    /// Next event, or `None` once the engine has stopped the torrent.
    async fn next_event(&mut self) -> Option<TorrentEvent>;

    /// Requests the first `len` bytes of file `index` so piece picking starts there.
    async fn touch(&mut self, index: usize, len: u64);

    /// Stops the torrent and frees its engine resources.
    async fn destroy(&mut self);
}

/// Runs torrent and magnet jobs on the configured engine.
#[derive(Clone, Default)]
pub struct TorrentStrategy {
    session: Option<Arc<dyn TorrentSession>>,
}

impl std::fmt::Debug for TorrentStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentStrategy")
            .field("embedded", &self.session.is_some())
            .finish()
    }
}

impl TorrentStrategy {
    #[must_use]
    pub fn new(session: Option<Arc<dyn TorrentSession>>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl FetchStrategy for TorrentStrategy {
    async fn fetch(&self, ctx: FetchContext) -> FetchOutcome {
        match (ctx.config.torrent_backend, &self.session) {
            (TorrentBackend::Embedded, Some(session)) => run_embedded(session.as_ref(), ctx).await,
            (TorrentBackend::Embedded, None) => {
                log::warn!(
                    "Job {}: embedded torrent engine not installed, using aria2c",
                    ctx.job.id
                );
                run_cli(ctx).await
            }
            (TorrentBackend::Cli, _) => run_cli(ctx).await,
        }
    }
}

fn no_peers(magnet: bool, after: Duration) -> FetchFailure {
    let message = if magnet {
        format!(
            "No peers found within {}s; magnet metadata could not be resolved",
            after.as_secs()
        )
    } else {
        format!("No peers found within {}s", after.as_secs())
    };
    FetchFailure::new(FailureClass::PeerConnectivity, message)
}

fn stalled(peers: u32, after: Duration) -> FetchFailure {
    FetchFailure::new(
        FailureClass::Transient,
        format!(
            "Torrent stalled: no data for {}s ({peers} peers seen)",
            after.as_secs()
        ),
    )
}

fn build_cli_command(config: &EngineConfig, source: &TorrentSource) -> ToolCommand {
    ToolCommand::new(&config.tools.aria2c)
        .arg(format!("--dir={}", config.download_dir.display()))
        .args([
            "--seed-time=0",
            "--summary-interval=1",
            "--console-log-level=notice",
            "--enable-color=false",
            "--follow-torrent=mem",
            "--bt-save-metadata=false",
            "--enable-dht=true",
            "--bt-enable-lpd=true",
            "--continue=true",
            "--",
        ])
        .arg(source.as_arg())
}

async fn run_cli(ctx: FetchContext) -> FetchOutcome {
    let FetchContext {
        job,
        config,
        mut reporter,
        cancel,
    } = ctx;
    let magnet = job.kind() == JobKind::Magnet;
    let source = TorrentSource::for_job(&job);
    let policy = RunPolicy {
        start_timeout: config.torrent_start_timeout(magnet),
        stall_timeout: config.stall_timeout(),
        kill_grace: config.kill_grace(),
    };

    let mut high = 0.0;
    let mut peers_seen = 0u32;
    let command = build_cli_command(&config, &source);
    let run = run_tool(&command, policy, &cancel, |line| {
        if let Some(c) = COMPLETE_RE.captures(line) {
            let path = c[1].trim();
            if !path.starts_with("[MEMORY]") {
                reporter.output(PathBuf::from(path));
            }
        }
        let update = parse_line(line);
        peers_seen = peers_seen.max(update.peers.unwrap_or(0));
        let moving = shows_transfer(&update, &mut high);
        reporter.progress(update);
        moving
    })
    .await;

    match run.exit {
        ToolExit::Success => FetchOutcome::Completed,
        ToolExit::Cancelled => FetchOutcome::Cancelled,
        ToolExit::SpawnFailed(e) => FetchOutcome::Failed(FetchFailure::new(
            FailureClass::Resource,
            format!("{} is not available: {e}", config.tools.aria2c),
        )),
        ToolExit::TimedOut { started: false, after } if peers_seen == 0 => {
            FetchOutcome::Failed(no_peers(magnet, after))
        }
        ToolExit::TimedOut { after, .. } => FetchOutcome::Failed(stalled(peers_seen, after)),
        ToolExit::Failed { code } => FetchOutcome::Failed(diagnose("aria2c", &run.tail, code)),
    }
}

async fn run_embedded(session: &dyn TorrentSession, ctx: FetchContext) -> FetchOutcome {
    let source = TorrentSource::for_job(&ctx.job);
    let added = tokio::select! {
        () = ctx.cancel.cancelled() => return FetchOutcome::Cancelled,
        added = session.add(source, &ctx.config.download_dir) => added,
    };
    let mut handle = match added {
        Ok(handle) => handle,
        Err(failure) => return FetchOutcome::Failed(failure),
    };

    let FetchContext {
        job,
        config,
        mut reporter,
        cancel,
    } = ctx;
    let outcome = drive(
        handle.as_mut(),
        job.kind() == JobKind::Magnet,
        &config,
        &mut reporter,
        &cancel,
    )
    .await;
    handle.destroy().await;
    outcome
}

/// Follows one embedded torrent until it completes, fails, stalls or is
/// cancelled. The caller destroys the handle afterwards.
async fn drive(
    handle: &mut dyn TorrentHandle,
    magnet: bool,
    config: &EngineConfig,
    reporter: &mut JobReporter,
    cancel: &CancellationToken,
) -> FetchOutcome {
    let mut limit = config.torrent_start_timeout(magnet);
    let mut deadline = Instant::now() + limit;
    let mut total: Option<u64> = None;
    let mut best = 0u64;
    let mut peers_seen = 0u32;

    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => return FetchOutcome::Cancelled,
            () = sleep_until(deadline) => {
                return FetchOutcome::Failed(if best == 0 && peers_seen == 0 {
                    no_peers(magnet && total.is_none(), limit)
                } else {
                    stalled(peers_seen, limit)
                });
            }
            event = handle.next_event() => event,
        };

        match event {
            None => {
                return FetchOutcome::Failed(FetchFailure::new(
                    FailureClass::Transient,
                    "Torrent engine stopped unexpectedly",
                ));
            }
            Some(TorrentEvent::Error(message)) => {
                return FetchOutcome::Failed(FetchFailure::new(FailureClass::Transient, message));
            }
            Some(TorrentEvent::Done) => return FetchOutcome::Completed,
            Some(TorrentEvent::Metadata { name, files }) => {
                let size: u64 = files.iter().map(|f| f.length).sum();
                total = Some(size);
                reporter.output(config.download_dir.join(&name));
                reporter.status(JobStatus::Downloading);
                reporter.progress(ProgressUpdate {
                    size: Some(format_bytes(size)),
                    ..ProgressUpdate::default()
                });
                for (index, file) in files.iter().enumerate().take(TOUCH_FILES) {
                    handle.touch(index, file.length.min(TOUCH_BYTES)).await;
                }
                // Metadata is progress for a magnet; the byte timer starts now.
                limit = config.torrent_start_timeout(false);
                deadline = Instant::now() + limit;
                if size == 0 {
                    return FetchOutcome::Completed;
                }
            }
            Some(TorrentEvent::Progress(p)) => {
                let downloaded: u64 = p.downloaded.iter().sum();
                peers_seen = peers_seen.max(p.peers);
                reporter.progress(progress_update(&p, downloaded, total));

                if downloaded > best {
                    best = downloaded;
                    limit = config.stall_timeout();
                    deadline = Instant::now() + limit;
                }
                if total.is_some_and(|t| downloaded >= t) {
                    return FetchOutcome::Completed;
                }
            }
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn progress_update(p: &TorrentProgress, downloaded: u64, total: Option<u64>) -> ProgressUpdate {
    let progress = match total {
        Some(t) if t > 0 => Some((downloaded as f64 / t as f64 * 100.0).min(100.0)),
        _ => p.percent,
    };
    let ratio = if downloaded > 0 {
        Some(p.uploaded as f64 / downloaded as f64)
    } else {
        None
    };
    ProgressUpdate {
        progress,
        speed: Some(format_rate(p.download_rate)),
        eta: None,
        size: None,
        peers: Some(p.peers),
        seeds: p.seeds,
        upload_speed: Some(format_rate(p.upload_rate)),
        ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{Report, StrategyEvent};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Calls {
        touched: Vec<(usize, u64)>,
        destroyed: usize,
    }

    struct MockHandle {
        events: mpsc::UnboundedReceiver<TorrentEvent>,
        calls: Arc<Mutex<Calls>>,
    }

    #[async_trait]
    impl TorrentHandle for MockHandle {
        async fn next_event(&mut self) -> Option<TorrentEvent> {
            self.events.recv().await
        }

        async fn touch(&mut self, index: usize, len: u64) {
            self.calls.lock().unwrap().touched.push((index, len));
        }

        async fn destroy(&mut self) {
            self.calls.lock().unwrap().destroyed += 1;
        }
    }

    /// Session whose single torrent replays scripted events, then idles.
    struct MockSession {
        handle: Mutex<Option<MockHandle>>,
    }

    #[async_trait]
    impl TorrentSession for MockSession {
        async fn add(
            &self,
            _source: TorrentSource,
            _dir: &Path,
        ) -> Result<Box<dyn TorrentHandle>, FetchFailure> {
            self.handle
                .lock()
                .unwrap()
                .take()
                .map(|h| Box::new(h) as Box<dyn TorrentHandle>)
                .ok_or_else(|| FetchFailure::new(FailureClass::Resource, "already added"))
        }
    }

    struct Harness {
        strategy: TorrentStrategy,
        events: mpsc::UnboundedSender<TorrentEvent>,
        calls: Arc<Mutex<Calls>>,
    }

    fn harness() -> Harness {
        let (events, rx) = mpsc::unbounded_channel();
        let calls = Arc::new(Mutex::new(Calls::default()));
        let session = MockSession {
            handle: Mutex::new(Some(MockHandle {
                events: rx,
                calls: Arc::clone(&calls),
            })),
        };
        Harness {
            strategy: TorrentStrategy::new(Some(Arc::new(session))),
            events,
            calls,
        }
    }

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_download_dir("/downloads")
            .with_torrent_backend(TorrentBackend::Embedded)
            .with_magnet_metadata_timeout_secs(30)
    }

    fn context(
        kind: JobKind,
        config: EngineConfig,
        cancel: CancellationToken,
    ) -> (FetchContext, mpsc::UnboundedReceiver<Report>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let url = if kind == JobKind::Magnet {
            "magnet:?xt=urn:btih:abc&dn=distro".to_string()
        } else {
            "https://example.com/distro.torrent".to_string()
        };
        let job = Job::new(1, url, "distro".to_string(), JobDetails::for_kind(kind, None));
        let ctx = FetchContext {
            job,
            config: Arc::new(config),
            reporter: JobReporter::new(1, tx, Duration::from_millis(500)),
            cancel,
        };
        (ctx, rx)
    }

    fn files() -> Vec<TorrentFile> {
        vec![
            TorrentFile {
                path: PathBuf::from("distro/a.iso"),
                length: 1_000_000,
            },
            TorrentFile {
                path: PathBuf::from("distro/b.txt"),
                length: 100,
            },
            TorrentFile {
                path: PathBuf::from("distro/c.txt"),
                length: 100,
            },
            TorrentFile {
                path: PathBuf::from("distro/d.txt"),
                length: 100,
            },
        ]
    }

    fn progress(downloaded: Vec<u64>, peers: u32) -> TorrentEvent {
        TorrentEvent::Progress(TorrentProgress {
            downloaded,
            peers,
            download_rate: 1024,
            ..TorrentProgress::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn completes_from_byte_counters_without_done_event() {
        let h = harness();
        h.events
            .send(TorrentEvent::Metadata {
                name: "distro".to_string(),
                files: files(),
            })
            .unwrap();
        h.events.send(progress(vec![500_000, 100, 0, 0], 4)).unwrap();
        h.events.send(progress(vec![1_000_000, 100, 100, 100], 4)).unwrap();

        let (ctx, mut rx) = context(JobKind::Magnet, config(), CancellationToken::new());
        let outcome = h.strategy.fetch(ctx).await;
        assert_eq!(outcome, FetchOutcome::Completed);

        let calls = h.calls.lock().unwrap();
        assert_eq!(calls.destroyed, 1);
        assert_eq!(calls.touched, vec![(0, TOUCH_BYTES), (1, 100), (2, 100)]);
        drop(calls);

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).map(|r| r.event).collect();
        assert!(events.contains(&StrategyEvent::Output(PathBuf::from("/downloads/distro"))));
        assert!(events.contains(&StrategyEvent::Status(JobStatus::Downloading)));
    }

    #[tokio::test(start_paused = true)]
    async fn magnet_without_peers_fails_on_metadata_timeout() {
        let h = harness();
        let (ctx, _rx) = context(JobKind::Magnet, config(), CancellationToken::new());
        let outcome = h.strategy.fetch(ctx).await;

        let FetchOutcome::Failed(failure) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(failure.class, FailureClass::PeerConnectivity);
        assert!(failure.message.contains("30s"));
        assert!(failure.message.contains("magnet metadata"));
        assert_eq!(h.calls.lock().unwrap().destroyed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_only_resets_on_real_progress() {
        let h = harness();
        let mut cfg = config();
        cfg.torrent_idle_timeout_secs = 60;
        cfg.stall_timeout_secs = 100;
        h.events
            .send(TorrentEvent::Metadata {
                name: "distro".to_string(),
                files: files(),
            })
            .unwrap();
        h.events.send(progress(vec![10, 0, 0, 0], 2)).unwrap();

        let sender = h.events.clone();
        tokio::spawn(async move {
            // Same byte count every 30s: peers but no data.
            for _ in 0..10 {
                tokio::time::sleep(Duration::from_secs(30)).await;
                let _ = sender.send(progress(vec![10, 0, 0, 0], 2));
            }
        });

        let started = Instant::now();
        let (ctx, _rx) = context(JobKind::Torrent, cfg, CancellationToken::new());
        let outcome = h.strategy.fetch(ctx).await;

        let FetchOutcome::Failed(failure) = outcome else {
            panic!("expected stall, got {outcome:?}");
        };
        assert_eq!(failure.class, FailureClass::Transient);
        assert!(failure.message.contains("stalled"));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(100));
        assert!(elapsed < Duration::from_secs(130));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_destroys_once() {
        let h = harness();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let (ctx, _rx) = context(JobKind::Torrent, config(), cancel);
        assert_eq!(h.strategy.fetch(ctx).await, FetchOutcome::Cancelled);
        assert_eq!(h.calls.lock().unwrap().destroyed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_error_is_reported() {
        let h = harness();
        h.events
            .send(TorrentEvent::Error("tracker refused".to_string()))
            .unwrap();
        let (ctx, _rx) = context(JobKind::Torrent, config(), CancellationToken::new());
        let outcome = h.strategy.fetch(ctx).await;
        assert!(matches!(outcome, FetchOutcome::Failed(f) if f.message == "tracker refused"));
        assert_eq!(h.calls.lock().unwrap().destroyed, 1);
    }

    #[tokio::test]
    async fn embedded_without_session_falls_back_to_cli() {
        let strategy = TorrentStrategy::new(None);
        let mut cfg = config();
        cfg.tools.aria2c = "/nonexistent/aria2c".to_string();
        let (ctx, _rx) = context(JobKind::Magnet, cfg, CancellationToken::new());
        let outcome = strategy.fetch(ctx).await;
        assert!(matches!(
            outcome,
            FetchOutcome::Failed(f) if f.class == FailureClass::Resource && f.message.contains("/nonexistent/aria2c")
        ));
    }

    #[test]
    fn source_prefers_local_metainfo() {
        let mut job = Job::new(
            1,
            "https://example.com/file".to_string(),
            "file".to_string(),
            JobDetails::Torrent {
                metainfo: Some("/downloads/file".to_string()),
                swarm: crate::job::SwarmStats::default(),
            },
        );
        assert_eq!(
            TorrentSource::for_job(&job),
            TorrentSource::File(PathBuf::from("/downloads/file"))
        );
        job.details = JobDetails::for_kind(JobKind::Torrent, None);
        assert_eq!(
            TorrentSource::for_job(&job),
            TorrentSource::Url("https://example.com/file".to_string())
        );
    }

    #[test]
    fn cli_command_seeds_nothing_and_targets_dir() {
        let cfg = config();
        let cmd = build_cli_command(&cfg, &TorrentSource::Magnet("magnet:?xt=urn:btih:abc".to_string()));
        assert!(cmd.args.contains(&"--seed-time=0".to_string()));
        assert!(cmd.args.contains(&"--dir=/downloads".to_string()));
        assert_eq!(cmd.args.last().map(String::as_str), Some("magnet:?xt=urn:btih:abc"));
    }

    #[test]
    fn progress_from_bytes_not_percent_event() {
        let p = TorrentProgress {
            downloaded: vec![50, 25],
            uploaded: 150,
            percent: Some(3.0),
            ..TorrentProgress::default()
        };
        let update = progress_update(&p, 75, Some(300));
        assert_eq!(update.progress, Some(25.0));
        assert_eq!(update.ratio, Some(2.0));
        assert_eq!(progress_update(&p, 75, None).progress, Some(3.0));
    }
}
