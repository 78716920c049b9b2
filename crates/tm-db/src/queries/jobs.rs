//! Job table operations.
//!
//! Every state change is a single guarded `UPDATE ... WHERE state = ?`,
//! which is what makes concurrent claims safe. Worker commits also guard
//! on the attempt count, tying them to the claim that produced them.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tm_core::{Error, FileRef, Job, JobId, JobState, Result};

use crate::models::{fmt_ts, job_from_row, JOB_COLS};
use crate::store::NewJob;

fn db_err(e: rusqlite::Error) -> Error {
    Error::database(e.to_string())
}

/// Insert a new queued job.
pub fn insert_job(conn: &Connection, id: JobId, new: &NewJob, now: DateTime<Utc>) -> Result<()> {
    let inputs = serde_json::to_string(&new.inputs)
        .map_err(|e| Error::Internal(format!("serialize inputs: {e}")))?;
    let options = serde_json::to_string(&new.options)
        .map_err(|e| Error::Internal(format!("serialize options: {e}")))?;
    let now = fmt_ts(now);

    conn.execute(
        "INSERT INTO jobs (id, session_id, tool, inputs, options, state, progress, attempts,
                           max_attempts, owner, tier, priority, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'queued', 0, 0, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            id.to_string(),
            new.session_id.to_string(),
            new.tool.as_str(),
            inputs,
            options,
            new.max_attempts,
            new.owner,
            new.tier.as_str(),
            new.priority,
            now,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Get a job by ID.
pub fn get_job(conn: &Connection, id: JobId) -> Result<Option<Job>> {
    let q = format!("SELECT {JOB_COLS} FROM jobs WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], job_from_row)
        .optional()
        .map_err(db_err)
}

/// Current state only, for diagnosing a failed guarded update.
fn get_state(conn: &Connection, id: JobId) -> Result<Option<JobState>> {
    Ok(get_claim(conn, id)?.map(|(state, _)| state))
}

/// Current state and attempt count.
fn get_claim(conn: &Connection, id: JobId) -> Result<Option<(JobState, u32)>> {
    let row: Option<(String, u32)> = conn
        .query_row(
            "SELECT state, attempts FROM jobs WHERE id = ?1",
            [id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(db_err)?;
    row.map(|(state, attempts)| Ok((state.parse()?, attempts))).transpose()
}

/// Compare-and-swap the job's state from `expected` to `next`.
///
/// The caller has already checked that the edge is legal and that the
/// patch carries what the target state needs. With `attempt` set the
/// update also requires the stored attempt count to match.
#[allow(clippy::too_many_arguments)]
pub fn transition(
    conn: &Connection,
    id: JobId,
    expected: JobState,
    next: JobState,
    result: Option<&[FileRef]>,
    failure_reason: Option<&str>,
    attempt: Option<u32>,
    now: DateTime<Utc>,
) -> Result<Job> {
    let now = fmt_ts(now);
    let set = match next {
        JobState::Active => "state = 'active', attempts = attempts + 1, heartbeat_at = ?3",
        JobState::Queued => "state = 'queued', heartbeat_at = NULL",
        JobState::Completed => "state = 'completed', progress = 100, heartbeat_at = NULL",
        JobState::Failed => "state = 'failed', heartbeat_at = NULL",
    };
    let result_json = result
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| Error::Internal(format!("serialize result: {e}")))?;

    let q = format!(
        "UPDATE jobs SET {set}, result = ?4, failure_reason = ?5, updated_at = ?3
         WHERE id = ?1 AND state = ?2 AND (?6 IS NULL OR attempts = ?6)
         RETURNING {JOB_COLS}"
    );
    let updated = conn
        .query_row(
            &q,
            params![id.to_string(), expected.as_str(), now, result_json, failure_reason, attempt],
            job_from_row,
        )
        .optional()
        .map_err(db_err)?;

    match updated {
        Some(job) => Ok(job),
        None => match get_claim(conn, id)? {
            None => Err(Error::not_found("job", id)),
            Some((actual, _)) if actual != expected => Err(Error::Conflict(format!(
                "job {id} is {actual}, expected {expected}"
            ))),
            Some((_, attempts)) => Err(Error::Conflict(format!(
                "job {id} is on attempt {attempts}, expected attempt {}",
                attempt.unwrap_or_default()
            ))),
        },
    }
}

/// Raise progress on an active job. Returns `false` when `progress` does
/// not exceed the stored value; the heartbeat is refreshed either way.
pub fn advance_progress(
    conn: &Connection,
    id: JobId,
    progress: u8,
    now: DateTime<Utc>,
) -> Result<bool> {
    let id_str = id.to_string();
    let now = fmt_ts(now);
    let advanced = conn
        .execute(
            "UPDATE jobs SET progress = ?2, heartbeat_at = ?3, updated_at = ?3
             WHERE id = ?1 AND state = 'active' AND progress < ?2",
            params![id_str, progress.min(100), now],
        )
        .map_err(db_err)?;
    if advanced > 0 {
        return Ok(true);
    }

    let touched = conn
        .execute(
            "UPDATE jobs SET heartbeat_at = ?2 WHERE id = ?1 AND state = 'active'",
            params![id_str, now],
        )
        .map_err(db_err)?;
    if touched > 0 {
        return Ok(false);
    }

    match get_state(conn, id)? {
        None => Err(Error::not_found("job", id)),
        Some(other) => Err(Error::InvalidState(format!(
            "cannot record progress on {other} job {id}"
        ))),
    }
}

/// Jobs in a state, oldest first.
pub fn list_by_state(conn: &Connection, state: JobState) -> Result<Vec<Job>> {
    let q = format!(
        "SELECT {JOB_COLS} FROM jobs WHERE state = ?1 ORDER BY created_at ASC, rowid ASC"
    );
    let mut stmt = conn.prepare(&q).map_err(db_err)?;
    let rows = stmt
        .query_map([state.as_str()], job_from_row)
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    Ok(rows)
}

/// Active jobs whose last heartbeat is older than `cutoff`.
pub fn list_stale_active(conn: &Connection, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
    let q = format!(
        "SELECT {JOB_COLS} FROM jobs
         WHERE state = 'active' AND (heartbeat_at IS NULL OR heartbeat_at < ?1)
         ORDER BY created_at ASC"
    );
    let mut stmt = conn.prepare(&q).map_err(db_err)?;
    let rows = stmt
        .query_map([fmt_ts(cutoff)], job_from_row)
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    Ok(rows)
}

/// Delete jobs in `state` last touched before `cutoff`, returning them.
pub fn delete_older_than(
    conn: &Connection,
    state: JobState,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Job>> {
    let q = format!("DELETE FROM jobs WHERE state = ?1 AND updated_at < ?2 RETURNING {JOB_COLS}");
    let mut stmt = conn.prepare(&q).map_err(db_err)?;
    let rows = stmt
        .query_map(params![state.as_str(), fmt_ts(cutoff)], job_from_row)
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    Ok(rows)
}

/// Number of queued or active jobs belonging to `owner`.
pub fn count_unfinished(conn: &Connection, owner: &str) -> Result<u32> {
    conn.query_row(
        "SELECT COUNT(*) FROM jobs WHERE owner = ?1 AND state IN ('queued', 'active')",
        [owner],
        |row| row.get(0),
    )
    .map_err(db_err)
}
