//! Media-page extraction through yt-dlp.

use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use url::Url;

use super::diagnose::diagnose;
use super::process::{RunPolicy, ToolCommand, ToolExit, run_tool};
use super::{FailureClass, FetchContext, FetchFailure, FetchOutcome, FetchStrategy, JobReporter};
use crate::config::{EngineConfig, Quality};
use crate::job::{JobDetails, JobStatus};
use crate::progress::parse_line;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
    (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

static DESTINATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(?:download|ExtractAudio)\] Destination: (.+)$").expect("valid regex")
});

static MERGER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\[Merger\] Merging formats into "(.+)"$"#).expect("valid regex")
});

static ALREADY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[download\] (.+) has already been downloaded").expect("valid regex")
});

static POSTPROCESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(?:Merger|ExtractAudio|VideoConvertor|VideoRemuxer|FixupM3u8|FixupM4a|EmbedThumbnail|Metadata)\]")
        .expect("valid regex")
});

/// How an attempt differs from a plain run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Attempt {
    /// Send browser-like request headers.
    browser_profile: bool,
    /// Discard resume state and fall back to the default format.
    fresh_start: bool,
}

/// Runs yt-dlp for media jobs.
///
/// Access-class failures get one more attempt with a browser-like request
/// profile and malformed-option failures one fresh start; each escalation
/// is used at most once per run.
#[derive(Debug, Clone, Default)]
pub struct MediaStrategy;

impl MediaStrategy {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn format_selector(config: &EngineConfig, hint: Option<&str>, attempt: Attempt) -> String {
    if attempt.fresh_start {
        return Quality::Best.format_selector().to_string();
    }
    hint.filter(|h| !h.trim().is_empty())
        .map_or_else(|| config.quality.format_selector().to_string(), ToString::to_string)
}

fn build_command(
    config: &EngineConfig,
    url: &str,
    hint: Option<&str>,
    attempt: Attempt,
) -> ToolCommand {
    let template = config
        .download_dir
        .join("%(title).200B [%(id)s].%(ext)s")
        .to_string_lossy()
        .into_owned();

    let mut cmd = ToolCommand::new(&config.tools.ytdlp).args([
        "--newline",
        "--no-playlist",
        "--no-colors",
        "--ignore-config",
        "-f",
    ]);
    cmd = cmd
        .arg(format_selector(config, hint, attempt))
        .arg("-o")
        .arg(template);

    if attempt.fresh_start {
        cmd = cmd.args(["--no-continue", "--no-part"]);
    } else {
        cmd = cmd.arg("--continue");
    }

    if attempt.browser_profile {
        cmd = cmd
            .arg("--user-agent")
            .arg(BROWSER_USER_AGENT)
            .arg("--add-header")
            .arg("Accept-Language:en-US,en;q=0.9");
        if let Some(origin) = Url::parse(url).ok().map(|u| u.origin().ascii_serialization()) {
            cmd = cmd.arg("--referer").arg(format!("{origin}/"));
        }
    }

    cmd.arg("--").arg(url)
}

/// Handles one output line; returns true if it showed transfer progress.
fn handle_line(line: &str, reporter: &mut JobReporter) -> bool {
    if let Some(c) = MERGER_RE.captures(line) {
        reporter.output(PathBuf::from(&c[1]));
    } else if let Some(c) = DESTINATION_RE.captures(line) {
        reporter.output(PathBuf::from(&c[1]));
    } else if let Some(c) = ALREADY_RE.captures(line) {
        reporter.output(PathBuf::from(&c[1]));
    }
    if POSTPROCESS_RE.is_match(line) {
        reporter.status(JobStatus::Processing);
        return true;
    }

    let update = parse_line(line);
    let progressed = update.progress.is_some();
    reporter.progress(update);
    progressed
}

#[async_trait]
impl FetchStrategy for MediaStrategy {
    async fn fetch(&self, ctx: FetchContext) -> FetchOutcome {
        let FetchContext {
            job,
            config,
            mut reporter,
            cancel,
        } = ctx;
        let hint = match &job.details {
            JobDetails::Media { format } => format.clone(),
            _ => None,
        };
        let policy = RunPolicy {
            start_timeout: config.stall_timeout(),
            stall_timeout: config.stall_timeout(),
            kill_grace: config.kill_grace(),
        };

        let mut attempt = Attempt::default();
        loop {
            let command = build_command(&config, &job.url, hint.as_deref(), attempt);
            let run = run_tool(&command, policy, &cancel, |line| {
                handle_line(line, &mut reporter)
            })
            .await;

            let failure = match run.exit {
                ToolExit::Success => return FetchOutcome::Completed,
                ToolExit::Cancelled => return FetchOutcome::Cancelled,
                ToolExit::SpawnFailed(e) => {
                    return FetchOutcome::Failed(FetchFailure::new(
                        FailureClass::Resource,
                        format!("{} is not available: {e}", config.tools.ytdlp),
                    ));
                }
                ToolExit::TimedOut { after, .. } => FetchFailure::new(
                    FailureClass::Transient,
                    format!("No download progress for {}s", after.as_secs()),
                ),
                ToolExit::Failed { code } => diagnose("yt-dlp", &run.tail, code),
            };

            if cancel.is_cancelled() {
                return FetchOutcome::Cancelled;
            }
            match failure.class {
                FailureClass::Access if !attempt.browser_profile => {
                    log::info!(
                        "Job {}: access denied, retrying with browser profile",
                        reporter.id()
                    );
                    attempt.browser_profile = true;
                }
                FailureClass::MalformedOption if !attempt.fresh_start => {
                    log::info!(
                        "Job {}: options rejected, retrying from scratch",
                        reporter.id()
                    );
                    attempt.fresh_start = true;
                }
                _ => return FetchOutcome::Failed(failure),
            }
        }
    }
}
