//! Row mapping between SQLite columns and `tm_core` types.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use serde::de::DeserializeOwned;
use std::str::FromStr;
use tm_core::Job;
use uuid::Uuid;

/// Column list matching [`job_from_row`].
pub const JOB_COLS: &str = "id, session_id, tool, inputs, options, state, progress,
    attempts, max_attempts, result, failure_reason, owner, tier, priority,
    created_at, updated_at, heartbeat_at";

/// Format a timestamp the way every column stores it.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_err(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    let uuid = Uuid::parse_str(&s).map_err(|e| conversion_err(idx, e))?;
    Ok(T::from(uuid))
}

fn parse_enum<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_err(idx, e))
}

fn parse_json<T: DeserializeOwned>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_err(idx, e))
}

fn parse_opt_json<T: DeserializeOwned>(
    row: &rusqlite::Row,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|v| serde_json::from_str(&v).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn parse_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_opt_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|v| {
        DateTime::parse_from_rfc3339(&v)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

/// Build a [`Job`] from a row selected with [`JOB_COLS`].
pub fn job_from_row(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    Ok(Job {
        id: parse_id(row, 0)?,
        session_id: parse_id(row, 1)?,
        tool: parse_enum(row, 2)?,
        inputs: parse_json(row, 3)?,
        options: parse_json(row, 4)?,
        state: parse_enum(row, 5)?,
        progress: row.get(6)?,
        attempts: row.get(7)?,
        max_attempts: row.get(8)?,
        result: parse_opt_json(row, 9)?,
        failure_reason: row.get(10)?,
        owner: row.get(11)?,
        tier: parse_enum(row, 12)?,
        priority: row.get(13)?,
        created_at: parse_ts(row, 14)?,
        updated_at: parse_ts(row, 15)?,
        heartbeat_at: parse_opt_ts(row, 16)?,
    })
}
