//! The Job Store: durable job records with compare-and-swap transitions.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::TransactionBehavior;
use tm_core::{
    Error, FileRef, Job, JobId, JobState, PlanTier, Result, SessionId, ToolId, ToolOptions,
};

use crate::pool::{self, DbPool};
use crate::queries::{jobs, usage};

/// Everything needed to create a queued job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub session_id: SessionId,
    pub tool: ToolId,
    pub inputs: Vec<FileRef>,
    pub options: ToolOptions,
    pub owner: String,
    pub tier: PlanTier,
    pub priority: u8,
    pub max_attempts: u32,
}

/// Data carried by a transition.
///
/// `attempt` pins the transition to one claim: when set, the update only
/// applies while the stored attempt count still equals it, so a worker
/// whose job was reclaimed and claimed again cannot commit.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub result: Option<Vec<FileRef>>,
    pub failure_reason: Option<String>,
    pub attempt: Option<u32>,
}

impl JobPatch {
    pub fn completed(result: Vec<FileRef>) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Only apply while the job is still on claim `attempt`.
    pub fn on_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

/// Persistent keyed store of jobs.
///
/// `transition` is the only way a job's state changes; every mutation is
/// atomic per job id.
pub trait JobStore: Send + Sync {
    /// Persist a new job in `Queued` and count its files against the
    /// owner's daily usage.
    fn create(&self, new: NewJob) -> Result<Job>;

    /// Fetch a job; [`Error::NotFound`] when absent.
    fn get(&self, id: JobId) -> Result<Job>;

    /// Move `id` from `expected` to `next`.
    ///
    /// Fails with [`Error::Conflict`] when the stored state differs from
    /// `expected` or the patch's attempt no longer matches, and with
    /// [`Error::InvalidState`] for edges outside the lifecycle or a patch
    /// missing what the target state requires.
    fn transition(&self, id: JobId, expected: JobState, next: JobState, patch: JobPatch)
        -> Result<Job>;

    /// Record progress on an active job; `Ok(false)` when it would not
    /// increase the stored value. Either way the job's heartbeat is
    /// refreshed.
    fn append_progress(&self, id: JobId, progress: u8) -> Result<bool>;

    /// Jobs in `state`, oldest first.
    fn list_in_state(&self, state: JobState) -> Result<Vec<Job>>;

    /// Active jobs whose heartbeat is older than `cutoff`.
    fn stale_active(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Remove terminal jobs in `state` last updated before `cutoff`.
    fn delete_terminal(&self, state: JobState, cutoff: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Queued plus active jobs owned by `owner`.
    fn count_unfinished(&self, owner: &str) -> Result<u32>;

    /// Files `owner` submitted on the given UTC day.
    fn files_submitted_on(&self, owner: &str, day: NaiveDate) -> Result<u64>;
}

/// [`JobStore`] backed by SQLite through an r2d2 pool.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: DbPool,
}

impl SqliteJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Open (or create) a database file and run migrations.
    pub fn open(db_path: &str) -> Result<Self> {
        Ok(Self::new(pool::init_pool(db_path)?))
    }

    /// Fresh isolated in-memory store.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(pool::init_memory_pool()?))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    fn check_patch(id: JobId, next: JobState, patch: &JobPatch) -> Result<()> {
        match next {
            JobState::Completed if patch.result.is_none() => Err(Error::InvalidState(format!(
                "job {id} cannot complete without a result"
            ))),
            JobState::Failed if patch.failure_reason.is_none() => Err(Error::InvalidState(
                format!("job {id} cannot fail without a reason"),
            )),
            JobState::Queued | JobState::Active
                if patch.result.is_some() || patch.failure_reason.is_some() =>
            {
                Err(Error::InvalidState(format!(
                    "job {id} cannot carry a result or reason while {next}"
                )))
            }
            _ => Ok(()),
        }
    }
}

impl JobStore for SqliteJobStore {
    fn create(&self, new: NewJob) -> Result<Job> {
        let id = JobId::new();
        let now = Utc::now();
        let mut conn = pool::get_conn(&self.pool)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::database(e.to_string()))?;

        jobs::insert_job(&tx, id, &new, now)?;
        usage::record_files(&tx, &new.owner, now.date_naive(), new.inputs.len() as u64)?;
        let job = jobs::get_job(&tx, id)?
            .ok_or_else(|| Error::Internal(format!("job {id} vanished after insert")))?;

        tx.commit().map_err(|e| Error::database(e.to_string()))?;
        tracing::debug!(job_id = %id, tool = %job.tool, owner = %job.owner, "Job created");
        Ok(job)
    }

    fn get(&self, id: JobId) -> Result<Job> {
        let conn = pool::get_conn(&self.pool)?;
        jobs::get_job(&conn, id)?.ok_or_else(|| Error::not_found("job", id))
    }

    fn transition(
        &self,
        id: JobId,
        expected: JobState,
        next: JobState,
        patch: JobPatch,
    ) -> Result<Job> {
        if !expected.can_transition_to(next) {
            return Err(Error::InvalidState(format!(
                "job {id} cannot move from {expected} to {next}"
            )));
        }
        Self::check_patch(id, next, &patch)?;

        let conn = pool::get_conn(&self.pool)?;
        let job = jobs::transition(
            &conn,
            id,
            expected,
            next,
            patch.result.as_deref(),
            patch.failure_reason.as_deref(),
            patch.attempt,
            Utc::now(),
        )?;
        tracing::debug!(job_id = %id, from = %expected, to = %next, "Job transitioned");
        Ok(job)
    }

    fn append_progress(&self, id: JobId, progress: u8) -> Result<bool> {
        let conn = pool::get_conn(&self.pool)?;
        jobs::advance_progress(&conn, id, progress, Utc::now())
    }

    fn list_in_state(&self, state: JobState) -> Result<Vec<Job>> {
        let conn = pool::get_conn(&self.pool)?;
        jobs::list_by_state(&conn, state)
    }

    fn stale_active(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let conn = pool::get_conn(&self.pool)?;
        jobs::list_stale_active(&conn, cutoff)
    }

    fn delete_terminal(&self, state: JobState, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        if !state.is_terminal() {
            return Err(Error::InvalidState(format!(
                "only terminal jobs can be purged, not {state}"
            )));
        }
        let conn = pool::get_conn(&self.pool)?;
        let deleted = jobs::delete_older_than(&conn, state, cutoff)?;
        // Counters from before yesterday can no longer affect a quota check.
        if let Some(yesterday) = Utc::now().date_naive().pred_opt() {
            usage::prune_before(&conn, yesterday)?;
        }
        Ok(deleted)
    }

    fn count_unfinished(&self, owner: &str) -> Result<u32> {
        let conn = pool::get_conn(&self.pool)?;
        jobs::count_unfinished(&conn, owner)
    }

    fn files_submitted_on(&self, owner: &str, day: NaiveDate) -> Result<u64> {
        let conn = pool::get_conn(&self.pool)?;
        usage::files_on(&conn, owner, day)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteJobStore {
        SqliteJobStore::in_memory().unwrap()
    }

    fn new_job(files: usize) -> NewJob {
        NewJob {
            session_id: SessionId::new(),
            tool: ToolId::ImgResize,
            inputs: (0..files)
                .map(|i| FileRef {
                    locator: format!("in/{i}.png"),
                    name: format!("{i}.png"),
                    size: 100,
                })
                .collect(),
            options: serde_json::json!({"width": 640})
                .as_object()
                .cloned()
                .unwrap(),
            owner: "client-1".into(),
            tier: PlanTier::Pro,
            priority: 1,
            max_attempts: 3,
        }
    }

    fn output() -> Vec<FileRef> {
        vec![FileRef {
            locator: "out/0.png".into(),
            name: "0.png".into(),
            size: 50,
        }]
    }

    #[test]
    fn create_starts_queued_and_counts_usage() {
        let store = store();
        let job = store.create(new_job(3)).unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.progress, 0);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.options["width"], 640);
        assert_eq!(job.tier, PlanTier::Pro);
        assert!(job.result.is_none() && job.failure_reason.is_none());

        let today = Utc::now().date_naive();
        assert_eq!(store.files_submitted_on("client-1", today).unwrap(), 3);
        store.create(new_job(2)).unwrap();
        assert_eq!(store.files_submitted_on("client-1", today).unwrap(), 5);
        assert_eq!(store.count_unfinished("client-1").unwrap(), 2);
    }

    #[test]
    fn get_missing_is_not_found() {
        let err = store().get(JobId::new()).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn full_lifecycle() {
        let store = store();
        let job = store.create(new_job(1)).unwrap();

        let active = store
            .transition(job.id, JobState::Queued, JobState::Active, JobPatch::default())
            .unwrap();
        assert_eq!(active.attempts, 1);

        assert!(store.append_progress(job.id, 55).unwrap());

        let done = store
            .transition(
                job.id,
                JobState::Active,
                JobState::Completed,
                JobPatch::completed(output()),
            )
            .unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.result.unwrap().len(), 1);
        assert!(done.heartbeat_at.is_none());
        assert_eq!(store.count_unfinished("client-1").unwrap(), 0);
    }

    #[test]
    fn terminal_jobs_are_immutable() {
        let store = store();
        let job = store.create(new_job(1)).unwrap();
        store
            .transition(job.id, JobState::Queued, JobState::Active, JobPatch::default())
            .unwrap();
        store
            .transition(job.id, JobState::Active, JobState::Failed, JobPatch::failed("boom"))
            .unwrap();

        let err = store
            .transition(job.id, JobState::Failed, JobState::Queued, JobPatch::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        let err = store.append_progress(job.id, 99).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        let stored = store.get(job.id).unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some("boom"));
    }

    #[test]
    fn patch_must_match_target() {
        let store = store();
        let job = store.create(new_job(1)).unwrap();
        store
            .transition(job.id, JobState::Queued, JobState::Active, JobPatch::default())
            .unwrap();

        let err = store
            .transition(job.id, JobState::Active, JobState::Completed, JobPatch::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        let err = store
            .transition(job.id, JobState::Active, JobState::Failed, JobPatch::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        // Still active after the rejected attempts.
        assert_eq!(store.get(job.id).unwrap().state, JobState::Active);
    }

    #[test]
    fn racing_claims_have_one_winner() {
        let store = store();
        let job = store.create(new_job(1)).unwrap();

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let store = &store;
                    s.spawn(move || {
                        store.transition(
                            job.id,
                            JobState::Queued,
                            JobState::Active,
                            JobPatch::default(),
                        )
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(Error::Conflict(_))))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 3);
        assert_eq!(store.get(job.id).unwrap().attempts, 1);
    }

    #[test]
    fn stale_claim_cannot_commit_after_reclaim() {
        let store = store();
        let job = store.create(new_job(1)).unwrap();
        let first = store
            .transition(job.id, JobState::Queued, JobState::Active, JobPatch::default())
            .unwrap();

        // Lease runs out, the job goes back to the queue and is claimed again.
        store
            .transition(
                job.id,
                JobState::Active,
                JobState::Queued,
                JobPatch::default().on_attempt(first.attempts),
            )
            .unwrap();
        let second = store
            .transition(job.id, JobState::Queued, JobState::Active, JobPatch::default())
            .unwrap();
        assert_eq!(second.attempts, 2);

        // The first worker's commit is rejected although the state matches.
        for patch in [JobPatch::completed(output()), JobPatch::failed("late")] {
            let next = if patch.result.is_some() {
                JobState::Completed
            } else {
                JobState::Failed
            };
            let err = store
                .transition(job.id, JobState::Active, next, patch.on_attempt(first.attempts))
                .unwrap_err();
            assert!(matches!(err, Error::Conflict(_)), "{err}");
        }
        let err = store
            .transition(
                job.id,
                JobState::Active,
                JobState::Queued,
                JobPatch::default().on_attempt(first.attempts),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let current = store.get(job.id).unwrap();
        assert_eq!(current.state, JobState::Active);
        assert!(current.result.is_none() && current.failure_reason.is_none());

        // The current claim commits normally.
        let done = store
            .transition(
                job.id,
                JobState::Active,
                JobState::Completed,
                JobPatch::completed(output()).on_attempt(second.attempts),
            )
            .unwrap();
        assert_eq!(done.state, JobState::Completed);
    }

    #[test]
    fn progress_refreshes_heartbeat_without_advancing() {
        let store = store();
        let job = store.create(new_job(1)).unwrap();
        let claimed = store
            .transition(job.id, JobState::Queued, JobState::Active, JobPatch::default())
            .unwrap();
        assert!(store.append_progress(job.id, 90).unwrap());
        let before = store.get(job.id).unwrap().heartbeat_at.unwrap();
        assert!(before >= claimed.heartbeat_at.unwrap());

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(!store.append_progress(job.id, 40).unwrap());
        let after = store.get(job.id).unwrap();
        assert_eq!(after.progress, 90);
        assert!(after.heartbeat_at.unwrap() > before);
    }

    #[test]
    fn stale_and_retention_queries() {
        let store = store();
        let stale = store.create(new_job(1)).unwrap();
        store
            .transition(stale.id, JobState::Queued, JobState::Active, JobPatch::default())
            .unwrap();

        let future = Utc::now() + chrono::Duration::seconds(60);
        let past = Utc::now() - chrono::Duration::seconds(60);
        assert_eq!(store.stale_active(future).unwrap().len(), 1);
        assert!(store.stale_active(past).unwrap().is_empty());

        store
            .transition(
                stale.id,
                JobState::Active,
                JobState::Completed,
                JobPatch::completed(output()),
            )
            .unwrap();

        assert!(store.delete_terminal(JobState::Completed, past).unwrap().is_empty());
        let purged = store.delete_terminal(JobState::Completed, future).unwrap();
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].id, stale.id);
        assert!(store.get(stale.id).is_err());

        let err = store.delete_terminal(JobState::Queued, future).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn list_in_state_is_fifo() {
        let store = store();
        let ids: Vec<_> = (0..3).map(|_| store.create(new_job(1)).unwrap().id).collect();
        let listed: Vec<_> = store
            .list_in_state(JobState::Queued)
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(listed, ids);
    }
}
