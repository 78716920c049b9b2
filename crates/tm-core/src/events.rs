//! Job event bus.
//!
//! [`EventBus`] fans job events out to per-job subscribers over unbounded
//! channels, so a slow observer never blocks the publishing worker. Every
//! event is also sent on a broadcast firehose and kept in a bounded ring
//! buffer of recent events so late-joining admin clients can catch up.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, mpsc};

use crate::ids::JobId;
use crate::job::FileRef;

/// Maximum number of events retained in the ring buffer.
const MAX_RECENT_EVENTS: usize = 100;

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// What happened to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventKind {
    Progress { progress: u8 },
    Completed { result: Vec<FileRef> },
    Failed { reason: String },
}

/// A timestamped event for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: JobEventKind,
}

impl JobEvent {
    pub fn new(job_id: JobId, kind: JobEventKind) -> Self {
        Self {
            job_id,
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Wire name, also used as the SSE event name.
    pub fn name(&self) -> &'static str {
        match self.kind {
            JobEventKind::Progress { .. } => "progress",
            JobEventKind::Completed { .. } => "completed",
            JobEventKind::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, JobEventKind::Progress { .. })
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<JobEvent>,
}

type SubscriberMap = DashMap<JobId, Vec<Subscriber>>;

/// Receiving half of a per-job subscription.
///
/// Dropping the handle removes it from the bus.
#[derive(Debug)]
pub struct Subscription {
    job_id: JobId,
    id: u64,
    rx: mpsc::UnboundedReceiver<JobEvent>,
    subscribers: Arc<SubscriberMap>,
}

impl Subscription {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Wait for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }

    /// Take the next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<JobEvent> {
        self.rx.try_recv().ok()
    }

    /// Explicit form of dropping the handle.
    pub fn unsubscribe(self) {}
}

impl futures_core::Stream for Subscription {
    type Item = JobEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<JobEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        remove_subscriber(&self.subscribers, self.job_id, Some(self.id));
    }
}

/// Drop one subscriber (or only closed ones when `id` is `None`) and the
/// job's entry once it is empty.
fn remove_subscriber(subscribers: &SubscriberMap, job_id: JobId, id: Option<u64>) {
    if let Some(mut subs) = subscribers.get_mut(&job_id) {
        subs.retain(|s| Some(s.id) != id && !s.tx.is_closed());
    }
    subscribers.remove_if(&job_id, |_, subs| subs.is_empty());
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Per-job publish/subscribe with a broadcast firehose for admin feeds.
pub struct EventBus {
    subscribers: Arc<SubscriberMap>,
    next_id: AtomicU64,
    firehose: broadcast::Sender<JobEvent>,
    recent: RwLock<VecDeque<JobEvent>>,
}

impl EventBus {
    /// Create a new event bus.
    ///
    /// `capacity` bounds the firehose channel only; per-job subscriptions
    /// are unbounded.
    pub fn new(capacity: usize) -> Self {
        let (firehose, _) = broadcast::channel(capacity);
        Self {
            subscribers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            firehose,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    /// Subscribe to future events of one job. Nothing published earlier is
    /// replayed.
    pub fn subscribe(&self, job_id: JobId) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(job_id)
            .or_default()
            .push(Subscriber { id, tx });
        Subscription {
            job_id,
            id,
            rx,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Subscribe to every event on the bus.
    pub fn subscribe_all(&self) -> broadcast::Receiver<JobEvent> {
        self.firehose.subscribe()
    }

    /// Deliver an event to every current subscriber of `job_id`.
    pub fn publish(&self, job_id: JobId, kind: JobEventKind) {
        let event = JobEvent::new(job_id, kind);

        let mut pruned = false;
        if let Some(mut subs) = self.subscribers.get_mut(&job_id) {
            subs.retain(|s| s.tx.send(event.clone()).is_ok());
            pruned = subs.is_empty();
        }
        if pruned {
            remove_subscriber(&self.subscribers, job_id, None);
        }

        {
            let mut recent = self.recent.write();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_back();
            }
            recent.push_front(event.clone());
        }

        // Ignore send errors (no firehose listeners).
        let _ = self.firehose.send(event);
    }

    /// Number of live subscriptions for a job.
    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.subscribers.get(&job_id).map_or(0, |subs| subs.len())
    }

    /// Return the `n` most recent events (newest first).
    pub fn recent_events(&self, n: usize) -> Vec<JobEvent> {
        let recent = self.recent.read();
        recent.iter().take(n).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
