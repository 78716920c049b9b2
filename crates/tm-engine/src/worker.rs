//! Worker pool.
//!
//! Each worker pulls job references from the queue, waits for a claim
//! slot, claims the job with a compare-and-swap, runs the tool handler
//! over every input file, and commits the outcome. Commits are pinned to
//! the claim's attempt number, so a worker whose lease was reclaimed
//! cannot overwrite a newer claim. Failures of one job never stop the
//! worker.

use std::sync::Arc;
use tm_core::events::{EventBus, JobEventKind};
use tm_core::{Error, FileRef, Job, JobState, Result};
use tm_db::{JobPatch, JobStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::limiter::ClaimLimiter;
use crate::progress::{self, ProgressRecorder};
use crate::queue::{JobQueue, QueueEntry};
use crate::retry::RetryPolicy;
use crate::storage::{Storage, StorageScope};
use crate::tools::{ToolHandler, ToolInput, ToolRegistry};

/// Longest failure reason kept on a job.
const MAX_REASON_CHARS: usize = 500;

/// Shared handles every worker needs.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub storage: Arc<dyn Storage>,
    pub queue: Arc<JobQueue>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<ToolRegistry>,
    pub limiter: ClaimLimiter,
    pub retry: RetryPolicy,
}

/// Spawn `count` workers that run until `cancel` fires.
pub fn spawn_workers(
    ctx: &WorkerContext,
    count: usize,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|worker| tokio::spawn(run_worker(ctx.clone(), worker, cancel.clone())))
        .collect()
}

/// Worker loop. Returns once `cancel` fires; a job already running is
/// finished first.
pub async fn run_worker(ctx: WorkerContext, worker: usize, cancel: CancellationToken) {
    tracing::info!(worker, "Worker started");

    while let Some(entry) = ctx.queue.dequeue(&cancel).await {
        if let Err(e) = process_entry(&ctx, entry, &cancel).await {
            tracing::error!(worker, job_id = %entry.job_id, error = %e, "Job processing error");
        }
    }

    tracing::info!(worker, "Worker stopped");
}

/// Claim and run one queued job.
async fn process_entry(
    ctx: &WorkerContext,
    entry: QueueEntry,
    cancel: &CancellationToken,
) -> Result<()> {
    let job = match ctx.store.get(entry.job_id) {
        Ok(job) => job,
        Err(Error::NotFound { .. }) => {
            tracing::debug!(job_id = %entry.job_id, "Dequeued job no longer exists");
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    if job.state != JobState::Queued {
        tracing::debug!(job_id = %job.id, state = %job.state, "Skipping job that is not queued");
        return Ok(());
    }

    if !ctx.limiter.acquire(cancel).await {
        // Shutting down; hand the entry back so the queue stays complete.
        ctx.queue.enqueue(entry);
        return Ok(());
    }

    let job = match ctx
        .store
        .transition(job.id, JobState::Queued, JobState::Active, JobPatch::default())
    {
        Ok(job) => job,
        Err(Error::Conflict(msg)) => {
            tracing::debug!(job_id = %entry.job_id, %msg, "Lost claim race");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    tracing::info!(
        job_id = %job.id,
        tool = %job.tool,
        attempt = job.attempts,
        files = job.inputs.len(),
        "Processing job"
    );

    let recorder = ProgressRecorder::new(job.id, Arc::clone(&ctx.store), Arc::clone(&ctx.bus));
    recorder.record(progress::CLAIMED);

    let Some(handler) = ctx.registry.get(job.tool) else {
        let reason = Error::UnknownTool(job.tool.to_string()).to_string();
        tracing::error!(job_id = %job.id, tool = %job.tool, "No handler registered for tool");
        return fail_job(ctx, &job, reason).map(|_| ());
    };

    match run_handler(ctx, &job, handler.as_ref(), &recorder).await {
        Ok(outputs) => complete_job(ctx, &job, outputs, &recorder),
        Err(e) => handle_failure(ctx, &job, e, cancel).await,
    }
}

/// Run the handler over each input in order, storing every output.
async fn run_handler(
    ctx: &WorkerContext,
    job: &Job,
    handler: &dyn ToolHandler,
    recorder: &ProgressRecorder,
) -> Result<Vec<FileRef>> {
    let total = job.inputs.len();
    let mut outputs = Vec::with_capacity(total);

    for (index, file) in job.inputs.iter().enumerate() {
        recorder.record(progress::file_start(index, total));

        let input = ToolInput {
            name: file.name.clone(),
            data: ctx.storage.fetch(file).await?,
        };
        let sink = recorder.for_file(index, total);
        let output = handler.execute(&input, &job.options, &sink).await?;

        let stored = ctx
            .storage
            .store(job.session_id, StorageScope::Output, &output.name, output.data)
            .await?;
        tracing::debug!(
            job_id = %job.id,
            handler = handler.name(),
            file = index + 1,
            of = total,
            output = %stored.locator,
            "File processed"
        );
        outputs.push(stored);
    }

    Ok(outputs)
}

fn complete_job(
    ctx: &WorkerContext,
    job: &Job,
    outputs: Vec<FileRef>,
    recorder: &ProgressRecorder,
) -> Result<()> {
    recorder.record(100);

    match ctx.store.transition(
        job.id,
        JobState::Active,
        JobState::Completed,
        JobPatch::completed(outputs.clone()).on_attempt(job.attempts),
    ) {
        Ok(_) => {}
        Err(Error::Conflict(msg)) => {
            tracing::warn!(job_id = %job.id, %msg, "Job was reclaimed before completion");
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    tracing::info!(job_id = %job.id, outputs = outputs.len(), "Job completed");
    ctx.bus
        .publish(job.id, JobEventKind::Completed { result: outputs });

    // Fire-and-forget: a failed purge leaves files for retention to remove.
    let storage = Arc::clone(&ctx.storage);
    let (job_id, session) = (job.id, job.session_id);
    tokio::spawn(async move {
        if let Err(e) = storage.purge(session, StorageScope::Input).await {
            tracing::warn!(
                job_id = %job_id,
                session = %session,
                error = %e,
                "Input cleanup failed"
            );
        }
    });

    Ok(())
}

/// Requeue with backoff while attempts remain, otherwise fail the job.
///
/// Outputs the failed attempt already stored are discarded once the
/// attempt's claim is released.
async fn handle_failure(
    ctx: &WorkerContext,
    job: &Job,
    error: Error,
    cancel: &CancellationToken,
) -> Result<()> {
    let reason = failure_reason(&error);

    if !job.can_retry() {
        tracing::error!(job_id = %job.id, attempt = job.attempts, error = %reason, "Job failed");
        if fail_job(ctx, job, reason)? {
            discard_outputs(ctx, job).await;
        }
        return Ok(());
    }

    let released = JobPatch::default().on_attempt(job.attempts);
    match ctx
        .store
        .transition(job.id, JobState::Active, JobState::Queued, released)
    {
        Ok(_) => {
            discard_outputs(ctx, job).await;
            let delay = ctx.retry.delay_for(job.attempts);
            tracing::warn!(
                job_id = %job.id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %reason,
                "Attempt failed; scheduling retry"
            );
            ctx.queue
                .enqueue_after(QueueEntry::new(job.id, job.priority), delay, cancel);
            Ok(())
        }
        Err(Error::Conflict(msg)) => {
            tracing::warn!(job_id = %job.id, %msg, "Job was reclaimed before retry");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Fail the job on its current claim. Returns whether this worker's
/// commit applied.
fn fail_job(ctx: &WorkerContext, job: &Job, reason: String) -> Result<bool> {
    match ctx.store.transition(
        job.id,
        JobState::Active,
        JobState::Failed,
        JobPatch::failed(reason.clone()).on_attempt(job.attempts),
    ) {
        Ok(_) => {
            ctx.bus.publish(job.id, JobEventKind::Failed { reason });
            Ok(true)
        }
        Err(Error::Conflict(msg)) => {
            tracing::warn!(job_id = %job.id, %msg, "Job was reclaimed before failing");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Drop the session's outputs so a retry starts from a clean scope.
async fn discard_outputs(ctx: &WorkerContext, job: &Job) {
    if let Err(e) = ctx.storage.purge(job.session_id, StorageScope::Output).await {
        tracing::warn!(job_id = %job.id, error = %e, "Failed to discard partial outputs");
    }
}

/// First line of the error, bounded in length.
pub fn failure_reason(error: &Error) -> String {
    let text = error.to_string();
    let first = text.lines().next().unwrap_or_default().trim();
    let reason: String = first.chars().take(MAX_REASON_CHARS).collect();
    if reason.is_empty() {
        "Processing failed".into()
    } else {
        reason
    }
}
