//! Periodic liveness and retention sweep.
//!
//! Active jobs whose worker stopped heartbeating are reclaimed, and
//! terminal jobs past their retention window are deleted together with
//! their stored files.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tm_core::config::RetentionConfig;
use tm_core::events::{EventBus, JobEventKind};
use tm_core::{Error, Job, JobState, Result};
use tm_db::{JobPatch, JobStore};
use tokio_util::sync::CancellationToken;

use crate::queue::{JobQueue, QueueEntry};
use crate::storage::{Storage, StorageScope};

/// Reason recorded when a lease runs out with no attempts left.
pub const LEASE_EXPIRED: &str = "Worker lease expired";

/// Upper bound for configured windows, keeps date arithmetic in range.
const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub failed: usize,
    pub purged: usize,
}

#[derive(Clone)]
pub struct Sweeper {
    pub store: Arc<dyn JobStore>,
    pub storage: Arc<dyn Storage>,
    pub queue: Arc<JobQueue>,
    pub bus: Arc<EventBus>,
    pub lease_timeout: Duration,
    pub retention: RetentionConfig,
}

fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    let secs = window.as_secs().min(MAX_WINDOW_SECS) as i64;
    now.checked_sub_signed(chrono::Duration::seconds(secs))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Sweeper {
    /// Run one pass of both sweeps as of `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        self.reclaim_stale(now, &mut report)?;
        self.purge_expired(now, &mut report).await?;

        if report != SweepReport::default() {
            tracing::info!(
                requeued = report.requeued,
                failed = report.failed,
                purged = report.purged,
                "Sweep finished"
            );
        }
        Ok(report)
    }

    fn reclaim_stale(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<()> {
        for job in self.store.stale_active(cutoff(now, self.lease_timeout))? {
            let outcome = if job.can_retry() {
                let released = JobPatch::default().on_attempt(job.attempts);
                self.store
                    .transition(job.id, JobState::Active, JobState::Queued, released)
                    .map(|_| {
                        self.queue.enqueue(QueueEntry::new(job.id, job.priority));
                        report.requeued += 1;
                        tracing::warn!(
                            job_id = %job.id,
                            attempt = job.attempts,
                            "Lease expired; job requeued"
                        );
                    })
            } else {
                self.store
                    .transition(
                        job.id,
                        JobState::Active,
                        JobState::Failed,
                        JobPatch::failed(LEASE_EXPIRED).on_attempt(job.attempts),
                    )
                    .map(|_| {
                        self.bus.publish(
                            job.id,
                            JobEventKind::Failed {
                                reason: LEASE_EXPIRED.into(),
                            },
                        );
                        report.failed += 1;
                        tracing::error!(
                            job_id = %job.id,
                            attempt = job.attempts,
                            "Lease expired; attempts exhausted"
                        );
                    })
            };

            match outcome {
                Ok(()) => {}
                // The worker committed first.
                Err(Error::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<()> {
        let windows = [
            (JobState::Completed, self.retention.completed_secs),
            (JobState::Failed, self.retention.failed_secs),
        ];
        for (state, secs) in windows {
            let deleted = self
                .store
                .delete_terminal(state, cutoff(now, Duration::from_secs(secs)))?;
            for job in &deleted {
                self.purge_files(job).await;
            }
            report.purged += deleted.len();
        }
        Ok(())
    }

    async fn purge_files(&self, job: &Job) {
        for scope in [StorageScope::Input, StorageScope::Output] {
            if let Err(e) = self.storage.purge(job.session_id, scope).await {
                tracing::warn!(job_id = %job.id, %scope, error = %e, "Failed to purge job files");
            }
        }
    }
}

/// Sweep every `interval` until `cancel` fires.
pub async fn run_sweeper(sweeper: Sweeper, interval: Duration, cancel: CancellationToken) {
    tracing::info!(interval_secs = interval.as_secs(), "Sweeper started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => break,
        }

        if let Err(e) = sweeper.sweep_once(Utc::now()).await {
            tracing::error!(error = %e, "Sweep failed");
        }
    }

    tracing::info!("Sweeper stopped");
}
