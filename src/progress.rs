//! Progress extraction from external tool output.
//!
//! Two grammars are understood: the media extractor's
//! `[download]  42.0% of 10MiB at 1.2MiB/s ETA 00:08` lines and the
//! segmented downloader's `[#1 4MiB/10MiB(40%) CN:4 SD:2 DL:300KiB ETA:20s]`
//! summaries. Every field is optional and extracted independently; a line
//! that matches nothing yields an empty update.

use std::sync::LazyLock;

use regex::Regex;

use crate::job::{Job, JobStatus};

const SIZE: &str = r"\d+(?:\.\d+)?[KMGTPE]?i?B";

static YTDLP_PERCENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[download\]\s+(\d{1,3}(?:\.\d+)?)%").expect("valid regex")
});

static ARIA2_PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((\d{1,3}(?:\.\d+)?)%\)").expect("valid regex"));

static ANY_PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[\s(])(\d{1,3}(?:\.\d+)?)%").expect("valid regex"));

static OF_SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"\bof\s+~?\s*({SIZE})")).expect("valid regex")
});

static AT_SPEED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\bat\s+({SIZE}/s)")).expect("valid regex"));

static ETA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bETA[:\s]\s*(\d[\d:hms]*)").expect("valid regex"));

static RATIO_SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"({SIZE})/({SIZE})\(\d")).expect("valid regex")
});

static CN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bCN:(\d+)").expect("valid regex"));

static SD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bSD:(\d+)").expect("valid regex"));

static DL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\bDL:({SIZE})(?:/s)?")).expect("valid regex"));

static UL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\bUL:({SIZE})(?:/s)?")).expect("valid regex"));

static SEED_RATIO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bSEED\((\d+(?:\.\d+)?)\)").expect("valid regex"));

/// Fields extracted from one line of tool output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub progress: Option<f64>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub size: Option<String>,
    pub peers: Option<u32>,
    pub seeds: Option<u32>,
    pub upload_speed: Option<String>,
    pub ratio: Option<f64>,
}

impl ProgressUpdate {
    /// Returns true if no field was extracted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn capture<'a>(re: &Regex, line: &'a str) -> Option<&'a str> {
    re.captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Extracts whatever progress fields `line` carries.
#[must_use]
pub fn parse_line(line: &str) -> ProgressUpdate {
    let progress = [&*YTDLP_PERCENT_RE, &*ARIA2_PERCENT_RE, &*ANY_PERCENT_RE]
        .into_iter()
        .find_map(|re| capture(re, line))
        .and_then(|p| p.parse::<f64>().ok())
        .map(|p| p.clamp(0.0, 100.0));

    let speed = capture(&AT_SPEED_RE, line)
        .map(ToString::to_string)
        .or_else(|| capture(&DL_RE, line).map(|s| format!("{s}/s")));

    let size = capture(&OF_SIZE_RE, line)
        .map(ToString::to_string)
        .or_else(|| {
            RATIO_SIZE_RE
                .captures(line)
                .and_then(|c| c.get(2))
                .map(|m| m.as_str().to_string())
        });

    ProgressUpdate {
        progress,
        speed,
        eta: capture(&ETA_RE, line).map(ToString::to_string),
        size,
        peers: capture(&CN_RE, line).and_then(|s| s.parse().ok()),
        seeds: capture(&SD_RE, line).and_then(|s| s.parse().ok()),
        upload_speed: capture(&UL_RE, line).map(|s| format!("{s}/s")),
        ratio: capture(&SEED_RATIO_RE, line).and_then(|s| s.parse().ok()),
    }
}

/// Writes `update` onto `job`, returning true if any field changed.
///
/// Progress never moves backwards while the job is downloading; a fresh
/// attempt resets it through [`Job::reset_transient`] instead. Swarm fields
/// are ignored for kinds that have no swarm.
pub fn apply(job: &mut Job, update: &ProgressUpdate) -> bool {
    let mut changed = false;

    if let Some(p) = update.progress {
        let p = p.clamp(0.0, 100.0);
        let backwards = job.status == JobStatus::Downloading && p < job.progress;
        if !backwards && (p - job.progress).abs() > f64::EPSILON {
            job.progress = p;
            changed = true;
        }
    }

    changed |= set_if_changed(&mut job.speed, update.speed.as_ref());
    changed |= set_if_changed(&mut job.eta, update.eta.as_ref());
    changed |= set_if_changed(&mut job.size, update.size.as_ref());

    if let Some(swarm) = job.details.swarm_mut() {
        if let Some(peers) = update.peers
            && swarm.peers != peers
        {
            swarm.peers = peers;
            changed = true;
        }
        if update.seeds.is_some() && swarm.seeds != update.seeds {
            swarm.seeds = update.seeds;
            changed = true;
        }
        changed |= set_if_changed(&mut swarm.upload_speed, update.upload_speed.as_ref());
        if let Some(ratio) = update.ratio
            && (swarm.ratio - ratio).abs() > f64::EPSILON
        {
            swarm.ratio = ratio;
            changed = true;
        }
    }

    changed
}

fn set_if_changed(slot: &mut Option<String>, value: Option<&String>) -> bool {
    match value {
        Some(v) if slot.as_ref() != Some(v) => {
            *slot = Some(v.clone());
            true
        }
        _ => false,
    }
}
