//! Fan-out of queue snapshots to live observers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;

use crate::queue::{QueueSnapshot, QueueStore};

/// Snapshots buffered per subscriber before it is marked behind.
pub const SUBSCRIBER_BUFFER: usize = 16;

/// Receiving end of a snapshot subscription.
pub type SnapshotReceiver = mpsc::Receiver<Arc<QueueSnapshot>>;

/// How quickly a change must reach observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    /// Progress-like changes, coalesced into one broadcast per interval.
    Throttled,
    /// Status transitions, sent at once.
    Immediate,
}

/// Throttled snapshot fan-out owned by the control loop.
///
/// A subscriber whose receiver was dropped is removed on the next send. A
/// subscriber whose buffer is full is marked behind and handed the latest
/// snapshot on a later tick, so the last state it sees is always current.
#[derive(Debug)]
pub struct Broadcaster {
    subscribers: Vec<Subscriber>,
    interval: Duration,
    last_sent: Option<Instant>,
    pending: bool,
}

#[derive(Debug)]
struct Subscriber {
    tx: mpsc::Sender<Arc<QueueSnapshot>>,
    /// Missed at least one snapshot since its last successful delivery.
    behind: bool,
}

impl Subscriber {
    /// Offers a snapshot; returns false once the receiver is gone.
    fn offer(&mut self, snapshot: &Arc<QueueSnapshot>) -> bool {
        match self.tx.try_send(Arc::clone(snapshot)) {
            Ok(()) => {
                self.behind = false;
                true
            }
            Err(TrySendError::Full(_)) => {
                log::trace!("Subscriber is behind; deferring snapshot");
                self.behind = true;
                true
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Subscriber disconnected");
                false
            }
        }
    }
}

impl Broadcaster {
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            subscribers: Vec::new(),
            interval,
            last_sent: None,
            pending: false,
        }
    }

    /// Adds a subscriber and delivers the current state to it first.
    pub fn subscribe(&mut self, store: &QueueStore) -> SnapshotReceiver {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        if tx.try_send(Arc::new(store.snapshot())).is_ok() {
            self.subscribers.push(Subscriber { tx, behind: false });
        }
        log::debug!("Subscriber added ({} total)", self.subscribers.len());
        rx
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Returns true if a throttled change has not been broadcast yet, or a
    /// subscriber still lacks the latest snapshot.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending || self.subscribers.iter().any(|s| s.behind)
    }

    /// Records a change and broadcasts now if allowed.
    pub fn notify(&mut self, store: &QueueStore, urgency: Urgency) {
        if urgency == Urgency::Immediate || self.window_elapsed() {
            self.send(store);
        } else {
            self.pending = true;
        }
    }

    /// Sends a coalesced broadcast once the throttle window has passed, and
    /// retries delivery to subscribers that were full last time.
    pub fn flush_pending(&mut self, store: &QueueStore) {
        if self.pending && self.window_elapsed() {
            self.send(store);
        } else if self.subscribers.iter().any(|s| s.behind) {
            let snapshot = Arc::new(store.snapshot());
            self.subscribers
                .retain_mut(|s| !s.behind || s.offer(&snapshot));
        }
    }

    fn window_elapsed(&self) -> bool {
        self.last_sent
            .is_none_or(|at| at.elapsed() >= self.interval)
    }

    fn send(&mut self, store: &QueueStore) {
        self.pending = false;
        self.last_sent = Some(Instant::now());
        if self.subscribers.is_empty() {
            return;
        }

        let snapshot = Arc::new(store.snapshot());
        self.subscribers.retain_mut(|s| s.offer(&snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobDetails, JobKind, JobStatus};

    fn store_with(n: usize) -> QueueStore {
        let mut store = QueueStore::new(3, 50);
        for _ in 0..n {
            let id = store.allocate_id();
            store.enqueue(Job::new(
                id,
                format!("https://example.com/{id}"),
                format!("job {id}"),
                JobDetails::for_kind(JobKind::Media, None),
            ));
        }
        store
    }

    #[tokio::test(start_paused = true)]
    async fn initial_snapshot_on_subscribe() {
        let mut b = Broadcaster::new(Duration::from_millis(250));
        let mut rx = b.subscribe(&store_with(2));
        let snap = rx.try_recv().unwrap();
        assert_eq!(snap.queued.len(), 2);
        assert_eq!(b.subscriber_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_updates_are_coalesced() {
        let mut b = Broadcaster::new(Duration::from_millis(250));
        let store = store_with(1);
        let mut rx = b.subscribe(&store);
        rx.try_recv().unwrap();

        b.notify(&store, Urgency::Throttled);
        assert!(rx.try_recv().is_ok());

        b.notify(&store, Urgency::Throttled);
        b.notify(&store, Urgency::Throttled);
        assert!(rx.try_recv().is_err());
        assert!(b.is_pending());

        b.flush_pending(&store);
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_millis(250)).await;
        b.flush_pending(&store);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert!(!b.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn status_transitions_bypass_throttle() {
        let mut b = Broadcaster::new(Duration::from_millis(250));
        let store = store_with(1);
        let mut rx = b.subscribe(&store);
        rx.try_recv().unwrap();

        b.notify(&store, Urgency::Throttled);
        b.notify(&store, Urgency::Immediate);
        b.notify(&store, Urgency::Immediate);
        assert_eq!(std::iter::from_fn(|| rx.try_recv().ok()).count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_subscribers_are_dropped_without_affecting_others() {
        let mut b = Broadcaster::new(Duration::from_millis(250));
        let store = store_with(1);
        let gone = b.subscribe(&store);
        let mut alive = b.subscribe(&store);
        alive.try_recv().unwrap();
        drop(gone);

        b.notify(&store, Urgency::Immediate);
        assert_eq!(b.subscriber_count(), 1);
        assert!(alive.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_subscriber_skips_but_stays() {
        let mut b = Broadcaster::new(Duration::from_millis(250));
        let store = store_with(1);
        let mut slow = b.subscribe(&store);

        for _ in 0..SUBSCRIBER_BUFFER + 5 {
            b.notify(&store, Urgency::Immediate);
        }
        assert_eq!(b.subscriber_count(), 1);
        let received = std::iter::from_fn(|| slow.try_recv().ok()).count();
        assert_eq!(received, SUBSCRIBER_BUFFER);

        b.notify(&store, Urgency::Immediate);
        assert!(slow.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_change_reaches_lagging_subscriber() {
        let mut b = Broadcaster::new(Duration::from_millis(250));
        let mut store = store_with(1);
        let mut slow = b.subscribe(&store);
        for _ in 1..SUBSCRIBER_BUFFER {
            b.notify(&store, Urgency::Immediate);
        }
        assert!(!b.is_pending());

        let id = store.queued()[0].id;
        let mut job = store.take_queued(id).unwrap();
        job.status = JobStatus::Failed;
        store.push_history(job);
        b.notify(&store, Urgency::Immediate);
        assert!(b.is_pending());

        let drained = std::iter::from_fn(|| slow.try_recv().ok()).last().unwrap();
        assert_eq!(drained.queued.len(), 1);

        b.flush_pending(&store);
        let latest = slow.try_recv().unwrap();
        assert!(latest.queued.is_empty());
        assert_eq!(latest.completed_history.len(), 1);
        assert_eq!(latest.completed_history[0].status, JobStatus::Failed);
        assert!(!b.is_pending());
        assert_eq!(b.subscriber_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn catch_up_does_not_resend_to_current_subscribers() {
        let mut b = Broadcaster::new(Duration::from_millis(250));
        let store = store_with(1);
        let mut slow = b.subscribe(&store);
        let mut fast = b.subscribe(&store);
        for _ in 0..SUBSCRIBER_BUFFER {
            b.notify(&store, Urgency::Immediate);
            fast.try_recv().unwrap();
        }
        fast.try_recv().unwrap();
        assert!(b.is_pending());

        while slow.try_recv().is_ok() {}
        b.flush_pending(&store);
        assert!(slow.try_recv().is_ok());
        assert!(fast.try_recv().is_err());
        assert!(!b.is_pending());
    }
}
