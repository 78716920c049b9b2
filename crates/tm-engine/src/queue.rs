//! In-process job queue.
//!
//! Entries are job references only; the Job Store remains the source of
//! truth. Delivery is at-least-once: a duplicate entry is harmless because
//! claiming goes through a compare-and-swap on the stored state.

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tm_core::JobId;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// A pending job reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: JobId,
    /// Lane; higher lanes are served first.
    pub priority: u8,
}

impl QueueEntry {
    pub fn new(job_id: JobId, priority: u8) -> Self {
        Self { job_id, priority }
    }
}

/// FIFO within a lane, highest lane first.
#[derive(Default)]
pub struct JobQueue {
    lanes: Mutex<BTreeMap<Reverse<u8>, VecDeque<JobId>>>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and wake one waiting consumer.
    pub fn enqueue(&self, entry: QueueEntry) {
        self.lanes
            .lock()
            .entry(Reverse(entry.priority))
            .or_default()
            .push_back(entry.job_id);
        self.notify.notify_one();
    }

    /// Enqueue after `delay` unless `cancel` fires first.
    ///
    /// A cancelled entry is simply dropped; the job is still `Queued` in
    /// the store and startup recovery picks it up again.
    pub fn enqueue_after(
        self: &Arc<Self>,
        entry: QueueEntry,
        delay: Duration,
        cancel: &CancellationToken,
    ) {
        let queue = Arc::clone(self);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.enqueue(entry),
                _ = cancel.cancelled() => {
                    tracing::debug!(job_id = %entry.job_id, "Delayed enqueue dropped on shutdown");
                }
            }
        });
    }

    /// Take the next entry without waiting.
    pub fn try_dequeue(&self) -> Option<QueueEntry> {
        let mut lanes = self.lanes.lock();
        let mut lane = lanes.first_entry()?;
        let priority = lane.key().0;
        let job_id = lane.get_mut().pop_front();
        if lane.get().is_empty() {
            lane.remove();
        }
        job_id.map(|job_id| QueueEntry { job_id, priority })
    }

    /// Wait for the next entry. Returns `None` once `cancel` fires.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<QueueEntry> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            // Register interest before checking so an enqueue in between
            // is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(entry) = self.try_dequeue() {
                return Some(entry);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Total entries across all lanes.
    pub fn len(&self) -> usize {
        self.lanes.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
