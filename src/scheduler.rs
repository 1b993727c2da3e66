//! Promote-step planning.
//!
//! The control loop asks [`plan_promotions`] which queued jobs may start
//! right now; it then dispatches them. Keeping the decision a pure function
//! of the queue and the current budget makes the concurrency caps testable
//! without processes or timers.

use crate::job::{Job, JobId};

/// Fixed cap on concurrently active torrent and magnet jobs.
pub const TORRENT_CONCURRENCY: usize = 2;

/// Concurrency currently in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    /// Global limit on active jobs.
    pub max_concurrent: usize,
    /// Jobs currently active.
    pub active: usize,
    /// Active jobs whose kind is torrent or magnet.
    pub active_torrents: usize,
}

impl Budget {
    #[must_use]
    pub const fn free_slots(&self) -> usize {
        self.max_concurrent.saturating_sub(self.active)
    }
}

/// Returns the ids of queued jobs to promote, in queue order.
///
/// Torrent and magnet jobs are skipped while their cap is saturated, so
/// later non-torrent jobs fill the remaining global slots ahead of them.
/// Under sustained non-torrent load a torrent job can therefore wait
/// indefinitely.
#[must_use]
pub fn plan_promotions(queued: &[Job], budget: Budget) -> Vec<JobId> {
    let mut slots = budget.free_slots();
    let mut torrents = budget.active_torrents;
    let mut picked = Vec::new();

    for job in queued {
        if slots == 0 {
            break;
        }
        if job.kind().is_torrent() {
            if torrents >= TORRENT_CONCURRENCY {
                continue;
            }
            torrents += 1;
        }
        picked.push(job.id);
        slots -= 1;
    }

    picked
}
