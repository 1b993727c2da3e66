//! Direct-file downloads through the segmented downloader (aria2c).

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE};

use super::diagnose::diagnose;
use super::process::{RunPolicy, ToolCommand, ToolExit, run_tool};
use super::{
    FailureClass, FetchContext, FetchFailure, FetchOutcome, FetchStrategy, shows_transfer,
};
use crate::classify::{content_disposition_filename, filename_from_url, sanitize_filename};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::fs::{FileSystem, TokioFileSystem};
use crate::job::{JobDetails, JobKind};
use crate::progress::parse_line;

/// Bytes read from a finished download when looking for torrent metadata.
const SNIFF_LEN: usize = 1024;

const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

const TORRENT_CONTENT_TYPE: &str = "application/x-bittorrent";

static COMPLETE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Download complete: (.+)$").expect("valid regex"));

/// What a `HEAD` request revealed about a direct link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadInfo {
    /// Filename from `Content-Disposition`.
    pub filename: Option<String>,
    /// The server labels the body as BitTorrent metadata.
    pub is_torrent: bool,
}

impl HeadInfo {
    fn from_headers(headers: &reqwest::header::HeaderMap) -> Self {
        let filename = headers
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(content_disposition_filename)
            .map(|name| sanitize_filename(&name))
            .filter(|name| !name.is_empty());
        let is_torrent = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with(TORRENT_CONTENT_TYPE));
        Self {
            filename,
            is_torrent,
        }
    }
}

/// Returns true if `bytes` start like a bencoded metainfo dictionary.
#[must_use]
pub fn looks_like_metainfo(bytes: &[u8]) -> bool {
    if bytes.len() < 4 || bytes[0] != b'd' || !bytes[1].is_ascii_digit() {
        return false;
    }
    [b"8:announce".as_slice(), b"4:info", b"13:announce-list"]
        .iter()
        .any(|key| bytes.windows(key.len()).any(|w| w == *key))
}

/// Downloads direct links with aria2c.
///
/// A best-effort `HEAD` request supplies the filename and catches links
/// that serve torrent metadata; a sniff of the finished file catches the
/// rest. Either way the job is handed back for re-classification instead
/// of failing.
pub struct FileStrategy<F: FileSystem = TokioFileSystem> {
    http: reqwest::Client,
    fs: F,
}

impl FileStrategy<TokioFileSystem> {
    /// Creates a strategy backed by the real file system.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new() -> Result<Self> {
        Self::with_fs(TokioFileSystem::new())
    }
}

impl<F: FileSystem> FileStrategy<F> {
    /// Creates a strategy with a custom file system.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn with_fs(fs: F) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HEAD_TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { http, fs })
    }

    async fn inspect(&self, url: &str) -> HeadInfo {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return HeadInfo::default();
        }
        match self.http.head(url).send().await {
            Ok(resp) => HeadInfo::from_headers(resp.headers()),
            Err(e) => {
                log::debug!("HEAD {url} failed: {e}");
                HeadInfo::default()
            }
        }
    }

    async fn sniff_metainfo(&self, path: &Path) -> bool {
        match self.fs.read_prefix(path, SNIFF_LEN).await {
            Ok(bytes) => looks_like_metainfo(&bytes),
            Err(e) => {
                log::debug!("Cannot sniff {}: {e}", path.display());
                false
            }
        }
    }
}

/// Picks the output filename: upstream hint, then server, then URL.
fn choose_filename(hint: Option<&str>, head: &HeadInfo, url: &str, fallback: &str) -> String {
    hint.map(sanitize_filename)
        .filter(|s| !s.is_empty())
        .or_else(|| head.filename.clone())
        .or_else(|| filename_from_url(url))
        .unwrap_or_else(|| fallback.to_string())
}

fn build_command(config: &EngineConfig, url: &str, filename: &str) -> ToolCommand {
    ToolCommand::new(&config.tools.aria2c)
        .arg(format!("--dir={}", config.download_dir.display()))
        .arg(format!("--out={filename}"))
        .arg(format!("--max-connection-per-server={}", config.connections.clamp(1, 16)))
        .arg(format!("--split={}", config.splits.max(1)))
        .args([
            "--min-split-size=1M",
            "--continue=true",
            "--summary-interval=1",
            "--console-log-level=notice",
            "--enable-color=false",
            "--follow-torrent=false",
            "--auto-file-renaming=false",
            "--allow-overwrite=false",
            "--",
        ])
        .arg(url)
}

#[async_trait]
impl<F: FileSystem> FetchStrategy for FileStrategy<F> {
    async fn fetch(&self, ctx: FetchContext) -> FetchOutcome {
        let FetchContext {
            job,
            config,
            mut reporter,
            cancel,
        } = ctx;

        let head = tokio::select! {
            () = cancel.cancelled() => return FetchOutcome::Cancelled,
            head = self.inspect(&job.url) => head,
        };
        if head.is_torrent {
            log::info!("Job {}: server reports torrent metadata", job.id);
            return FetchOutcome::Reclassify {
                kind: JobKind::Torrent,
                metainfo: None,
            };
        }

        let hint = match &job.details {
            JobDetails::File { filename } => filename.as_deref(),
            _ => None,
        };
        let filename = choose_filename(hint, &head, &job.url, &format!("download-{}", job.id));
        let mut output: PathBuf = config.download_dir.join(&filename);
        reporter.output(&output);

        if let Err(e) = self.fs.create_dir_all(&config.download_dir).await {
            return FetchOutcome::Failed(FetchFailure::new(
                FailureClass::Resource,
                format!("Cannot create {}: {e}", config.download_dir.display()),
            ));
        }

        let policy = RunPolicy {
            start_timeout: config.stall_timeout(),
            stall_timeout: config.stall_timeout(),
            kill_grace: config.kill_grace(),
        };
        let command = build_command(&config, &job.url, &filename);
        let mut high = 0.0;
        let mut completed_at: Option<PathBuf> = None;
        let run = run_tool(&command, policy, &cancel, |line| {
            if let Some(c) = COMPLETE_RE.captures(line) {
                completed_at = Some(PathBuf::from(c[1].trim()));
            }
            let update = parse_line(line);
            let moving = shows_transfer(&update, &mut high);
            reporter.progress(update);
            moving
        })
        .await;

        match run.exit {
            ToolExit::Success => {}
            ToolExit::Cancelled => return FetchOutcome::Cancelled,
            ToolExit::SpawnFailed(e) => {
                return FetchOutcome::Failed(FetchFailure::new(
                    FailureClass::Resource,
                    format!("{} is not available: {e}", config.tools.aria2c),
                ));
            }
            ToolExit::TimedOut { after, .. } => {
                return FetchOutcome::Failed(FetchFailure::new(
                    FailureClass::Transient,
                    format!("No download progress for {}s", after.as_secs()),
                ));
            }
            ToolExit::Failed { code } => {
                return FetchOutcome::Failed(diagnose("aria2c", &run.tail, code));
            }
        }

        if let Some(actual) = completed_at
            && actual != output
        {
            reporter.output(&actual);
            output = actual;
        }

        if self.sniff_metainfo(&output).await {
            log::info!("Job {}: downloaded file is torrent metadata", job.id);
            return FetchOutcome::Reclassify {
                kind: JobKind::Torrent,
                metainfo: Some(output),
            };
        }
        FetchOutcome::Completed
    }
}
