//! Queue statistics types.

use serde::{Deserialize, Serialize};

use crate::format::{format_rate, parse_bytes};
use crate::job::{Job, JobStatus};

/// Per-collection job counts reported with every snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs waiting to be promoted.
    pub queued_count: usize,
    /// Jobs with a running process or engine.
    pub active_count: usize,
    /// Jobs waiting out a retry delay.
    pub retrying_count: usize,
    /// Completed jobs still in history.
    pub completed_count: usize,
    /// Failed jobs still in history.
    pub failed_count: usize,
    /// Cancelled jobs still in history.
    pub cancelled_count: usize,
}

impl QueueStats {
    /// Counts jobs across the store's collections.
    #[must_use]
    pub fn collect<'a>(
        queued: usize,
        active: usize,
        retrying: usize,
        history: impl IntoIterator<Item = &'a Job>,
    ) -> Self {
        let mut stats = Self {
            queued_count: queued,
            active_count: active,
            retrying_count: retrying,
            ..Self::default()
        };
        for job in history {
            match job.status {
                JobStatus::Completed => stats.completed_count += 1,
                JobStatus::Failed => stats.failed_count += 1,
                JobStatus::Cancelled => stats.cancelled_count += 1,
                _ => {}
            }
        }
        stats
    }
}

/// Aggregate transfer rates of the active jobs in bytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferRates {
    pub download: u64,
    pub upload: u64,
}

impl TransferRates {
    /// Sums the display rates reported by each job's tool.
    ///
    /// Rates that cannot be parsed (e.g. `Unknown B/s`) count as zero.
    #[must_use]
    pub fn sum<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        jobs.into_iter().fold(Self::default(), |acc, job| {
            let download = job.speed.as_deref().and_then(parse_bytes).unwrap_or(0);
            let upload = job
                .details
                .swarm()
                .and_then(|s| s.upload_speed.as_deref())
                .and_then(parse_bytes)
                .unwrap_or(0);
            Self {
                download: acc.download.saturating_add(download),
                upload: acc.upload.saturating_add(upload),
            }
        })
    }

    #[must_use]
    pub fn download_display(&self) -> String {
        format_rate(self.download)
    }

    #[must_use]
    pub fn upload_display(&self) -> String {
        format_rate(self.upload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobDetails, JobKind};

    fn job(kind: JobKind, status: JobStatus) -> Job {
        let mut j = Job::new(
            1,
            "https://example.com/x".to_string(),
            "x".to_string(),
            JobDetails::for_kind(kind, None),
        );
        j.status = status;
        j
    }

    #[test]
    fn counts_history_by_status() {
        let history = vec![
            job(JobKind::Media, JobStatus::Completed),
            job(JobKind::Media, JobStatus::Completed),
            job(JobKind::File, JobStatus::Failed),
            job(JobKind::Magnet, JobStatus::Cancelled),
        ];
        let stats = QueueStats::collect(4, 2, 1, &history);
        assert_eq!(stats.queued_count, 4);
        assert_eq!(stats.active_count, 2);
        assert_eq!(stats.retrying_count, 1);
        assert_eq!(stats.completed_count, 2);
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.cancelled_count, 1);
    }

    #[test]
    fn sums_rates_across_jobs() {
        let mut a = job(JobKind::Media, JobStatus::Downloading);
        a.speed = Some("1MiB/s".to_string());
        let mut b = job(JobKind::Magnet, JobStatus::Downloading);
        b.speed = Some("512KiB/s".to_string());
        if let Some(swarm) = b.details.swarm_mut() {
            swarm.upload_speed = Some("100KiB/s".to_string());
        }
        let mut c = job(JobKind::File, JobStatus::Starting);
        c.speed = Some("Unknown B/s".to_string());

        let rates = TransferRates::sum([&a, &b, &c]);
        assert_eq!(rates.download, 1024 * 1024 + 512 * 1024);
        assert_eq!(rates.upload, 100 * 1024);
    }

    #[test]
    fn empty_rates() {
        let rates = TransferRates::sum(std::iter::empty());
        assert_eq!(rates, TransferRates::default());
    }
}
