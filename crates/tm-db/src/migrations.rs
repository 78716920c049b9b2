//! Embedded SQL migrations and runner.
//!
//! Migrations are stored as `&str` constants and executed in order.  A
//! `schema_migrations` table tracks which versions have been applied.

use rusqlite::Connection;
use tm_core::{Error, Result};

/// V1: jobs table.
///
/// Timestamps are RFC 3339 UTC strings with fixed precision, so text
/// comparison orders them chronologically.
const V1_JOBS: &str = r#"
CREATE TABLE jobs (
    id             TEXT PRIMARY KEY,
    session_id     TEXT NOT NULL,
    tool           TEXT NOT NULL,
    inputs         TEXT NOT NULL,
    options        TEXT NOT NULL DEFAULT '{}',
    state          TEXT NOT NULL DEFAULT 'queued'
                   CHECK (state IN ('queued', 'active', 'completed', 'failed')),
    progress       INTEGER NOT NULL DEFAULT 0 CHECK (progress BETWEEN 0 AND 100),
    attempts       INTEGER NOT NULL DEFAULT 0,
    max_attempts   INTEGER NOT NULL,
    result         TEXT,
    failure_reason TEXT,
    owner          TEXT NOT NULL,
    tier           TEXT NOT NULL,
    priority       INTEGER NOT NULL DEFAULT 0,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    heartbeat_at   TEXT
);

CREATE INDEX idx_jobs_state_created ON jobs(state, created_at);
CREATE INDEX idx_jobs_owner_state ON jobs(owner, state);
"#;

/// V2: per-owner daily file counters for quota enforcement.
const V2_DAILY_USAGE: &str = r#"
CREATE TABLE daily_usage (
    owner TEXT NOT NULL,
    day   TEXT NOT NULL,
    files INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (owner, day)
);
"#;

/// V3: retention sweeps filter terminal jobs by age.
const V3_RETENTION_INDEX: &str = r#"
CREATE INDEX idx_jobs_state_updated ON jobs(state, updated_at);
"#;

const MIGRATIONS: &[(i64, &str)] = &[
    (1, V1_JOBS),
    (2, V2_DAILY_USAGE),
    (3, V3_RETENTION_INDEX),
];

/// Apply every migration not yet recorded in `schema_migrations`.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .map_err(|e| Error::database(format!("Failed to create schema_migrations: {e}")))?;

    for &(version, sql) in MIGRATIONS {
        let already: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )
            .map_err(|e| Error::database(e.to_string()))?;

        if already {
            continue;
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::database(e.to_string()))?;

        tx.execute_batch(sql)
            .map_err(|e| Error::database(format!("Migration V{version} failed: {e}")))?;

        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(|e| Error::database(e.to_string()))?;

        tx.commit().map_err(|e| Error::database(e.to_string()))?;
        tracing::debug!(version, "Applied migration");
    }

    Ok(())
}
