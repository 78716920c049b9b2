//! Engine facade: owns the queue, bus, workers and sweeper, and exposes
//! submission, status pull and status push.

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tm_core::config::{Config, RateLimitConfig, RetentionConfig, TiersConfig};
use tm_core::events::{EventBus, Subscription};
use tm_core::{
    Error, FileRef, Job, JobId, JobState, PlanTier, Result, SessionId, ToolId, ToolOptions,
};
use tm_db::{JobStore, NewJob};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admission::{AdmissionPolicy, AdmissionRequest, CallerUsage};
use crate::limiter::ClaimLimiter;
use crate::queue::{JobQueue, QueueEntry};
use crate::retry::RetryPolicy;
use crate::storage::{Storage, StorageScope};
use crate::sweeper::{self, Sweeper};
use crate::tools::ToolRegistry;
use crate::worker::{self, WorkerContext};

/// Engine tuning, normally derived from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitConfig,
    pub lease_timeout: Duration,
    pub sweep_interval: Duration,
    pub retention: RetentionConfig,
    /// Lane jobs by plan tier instead of pure FIFO.
    pub tier_priority: bool,
    pub tiers: TiersConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.workers.concurrency.max(1),
            retry: RetryPolicy::from(&config.workers),
            rate_limit: config.workers.rate_limit.clone(),
            lease_timeout: config.workers.lease_timeout(),
            sweep_interval: config.workers.sweep_interval(),
            retention: config.retention.clone(),
            tier_priority: config.queue.tier_priority,
            tiers: config.tiers.clone(),
        }
    }
}

/// A submission whose files are already in storage.
#[derive(Debug, Clone)]
pub struct Submission {
    pub tool: ToolId,
    pub inputs: Vec<FileRef>,
    pub options: ToolOptions,
    pub tier: PlanTier,
    pub owner: String,
    pub session_id: SessionId,
}

/// A submission carrying raw file contents.
#[derive(Debug, Clone)]
pub struct Upload {
    pub tool: ToolId,
    /// `(file name, contents)` in submission order.
    pub files: Vec<(String, Bytes)>,
    pub options: ToolOptions,
    pub tier: PlanTier,
    pub owner: String,
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    storage: Arc<dyn Storage>,
    queue: Arc<JobQueue>,
    bus: Arc<EventBus>,
    registry: Arc<ToolRegistry>,
    admission: AdmissionPolicy,
    /// Serializes usage checks with job creation so quotas hold under
    /// concurrent submissions.
    admission_lock: Mutex<()>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn JobStore>,
        storage: Arc<dyn Storage>,
        registry: ToolRegistry,
    ) -> Self {
        let admission = AdmissionPolicy::new(config.tiers.clone());
        Self {
            config,
            store,
            storage,
            queue: Arc::new(JobQueue::new()),
            bus: Arc::new(EventBus::default()),
            registry: Arc::new(registry),
            admission,
            admission_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    fn sweeper(&self) -> Sweeper {
        Sweeper {
            store: Arc::clone(&self.store),
            storage: Arc::clone(&self.storage),
            queue: Arc::clone(&self.queue),
            bus: Arc::clone(&self.bus),
            lease_timeout: self.config.lease_timeout,
            retention: self.config.retention.clone(),
        }
    }

    /// Recover persisted work, then spawn workers and the sweeper.
    ///
    /// Expired leases are reclaimed first so their jobs are re-enqueued
    /// along with every other queued job, oldest first.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState("engine already started".into()));
        }

        let sweeper = self.sweeper();
        let report = sweeper.sweep_once(Utc::now()).await?;
        // Reclaimed jobs were enqueued by the sweep; start from a clean
        // queue so recovery does not double them up.
        while self.queue.try_dequeue().is_some() {}

        let pending = self.store.list_in_state(JobState::Queued)?;
        for job in &pending {
            self.queue.enqueue(QueueEntry::new(job.id, job.priority));
        }
        tracing::info!(
            recovered = pending.len(),
            reclaimed = report.requeued,
            workers = self.config.workers,
            "Engine starting"
        );

        let ctx = WorkerContext {
            store: Arc::clone(&self.store),
            storage: Arc::clone(&self.storage),
            queue: Arc::clone(&self.queue),
            bus: Arc::clone(&self.bus),
            registry: Arc::clone(&self.registry),
            limiter: ClaimLimiter::from(&self.config.rate_limit),
            retry: self.config.retry,
        };

        let mut tasks = worker::spawn_workers(&ctx, self.config.workers, &self.cancel);
        tasks.push(tokio::spawn(sweeper::run_sweeper(
            sweeper,
            self.config.sweep_interval,
            self.cancel.clone(),
        )));
        self.tasks.lock().extend(tasks);
        Ok(())
    }

    /// Stop workers and the sweeper, waiting for in-flight jobs.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Engine task panicked");
            }
        }
        tracing::info!("Engine stopped");
    }

    /// Token cancelled on shutdown.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn admit(&self, tier: PlanTier, owner: &str, files: &[(&str, u64)]) -> Result<()> {
        if files.is_empty() {
            return Err(Error::Validation("No files provided".into()));
        }
        let usage = CallerUsage {
            files_today: self.store.files_submitted_on(owner, Utc::now().date_naive())?,
            active_jobs: self.store.count_unfinished(owner)?,
        };
        let request = AdmissionRequest {
            tier,
            files: files.to_vec(),
        };
        self.admission.authorize(&request, &usage).map_err(|rejection| {
            tracing::info!(owner, %tier, reason = %rejection, "Submission rejected");
            Error::Rejected(rejection)
        })
    }

    /// Admit and enqueue a job whose inputs are already stored.
    pub fn submit(&self, submission: Submission) -> Result<Job> {
        let files: Vec<_> = submission
            .inputs
            .iter()
            .map(|f| (f.name.as_str(), f.size))
            .collect();

        let job = {
            let _guard = self.admission_lock.lock();
            self.admit(submission.tier, &submission.owner, &files)?;
            self.store.create(NewJob {
                session_id: submission.session_id,
                tool: submission.tool,
                priority: if self.config.tier_priority {
                    submission.tier.queue_priority()
                } else {
                    0
                },
                inputs: submission.inputs,
                options: submission.options,
                owner: submission.owner,
                tier: submission.tier,
                max_attempts: self.config.retry.max_attempts,
            })?
        };

        self.queue.enqueue(QueueEntry::new(job.id, job.priority));
        tracing::info!(
            job_id = %job.id,
            tool = %job.tool,
            files = job.inputs.len(),
            owner = %job.owner,
            "Job queued"
        );
        Ok(job)
    }

    /// Store uploaded files under a new session and submit them.
    ///
    /// Admission runs before anything is written; stored inputs are removed
    /// again if the final admission check or job creation fails.
    pub async fn submit_upload(&self, upload: Upload) -> Result<Job> {
        let files: Vec<_> = upload
            .files
            .iter()
            .map(|(name, data)| (name.as_str(), data.len() as u64))
            .collect();
        self.admit(upload.tier, &upload.owner, &files)?;

        let session_id = SessionId::new();
        let mut inputs = Vec::with_capacity(upload.files.len());
        for (name, data) in upload.files {
            match self
                .storage
                .store(session_id, StorageScope::Input, &name, data)
                .await
            {
                Ok(file) => inputs.push(file),
                Err(e) => {
                    self.discard_session(session_id).await;
                    return Err(e);
                }
            }
        }

        let submitted = self.submit(Submission {
            tool: upload.tool,
            inputs,
            options: upload.options,
            tier: upload.tier,
            owner: upload.owner,
            session_id,
        });
        if submitted.is_err() {
            self.discard_session(session_id).await;
        }
        submitted
    }

    async fn discard_session(&self, session: SessionId) {
        if let Err(e) = self.storage.purge(session, StorageScope::Input).await {
            tracing::warn!(session = %session, error = %e, "Failed to discard uploaded files");
        }
    }

    /// Current job state.
    pub fn status(&self, id: JobId) -> Result<Job> {
        self.store.get(id)
    }

    /// Subscribe to future events of a job.
    pub fn subscribe(&self, id: JobId) -> Subscription {
        self.bus.subscribe(id)
    }

    /// Subscribe, then read the job, so no event between the two is lost.
    pub fn watch(&self, id: JobId) -> Result<(Job, Subscription)> {
        let subscription = self.bus.subscribe(id);
        let job = self.store.get(id)?;
        Ok((job, subscription))
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
