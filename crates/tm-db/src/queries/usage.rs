//! Daily per-owner file counters.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use tm_core::{Error, Result};

fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// Add `files` to the owner's counter for `day`.
pub fn record_files(conn: &Connection, owner: &str, day: NaiveDate, files: u64) -> Result<()> {
    conn.execute(
        "INSERT INTO daily_usage (owner, day, files) VALUES (?1, ?2, ?3)
         ON CONFLICT(owner, day) DO UPDATE SET files = files + excluded.files",
        params![owner, day_key(day), files],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(())
}

/// Files the owner submitted on `day`.
pub fn files_on(conn: &Connection, owner: &str, day: NaiveDate) -> Result<u64> {
    let files: Option<u64> = conn
        .query_row(
            "SELECT files FROM daily_usage WHERE owner = ?1 AND day = ?2",
            params![owner, day_key(day)],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(files.unwrap_or(0))
}

/// Drop counters for days before `day`.
pub fn prune_before(conn: &Connection, day: NaiveDate) -> Result<usize> {
    conn.execute("DELETE FROM daily_usage WHERE day < ?1", [day_key(day)])
        .map_err(|e| Error::database(e.to_string()))
}
