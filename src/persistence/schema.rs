//! `SQLite` schema bootstrap logic.
//!
//! All definitions use `IF NOT EXISTS` and are safe to re-run on every
//! startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table and index definitions to the connected database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS session (
    id                TEXT PRIMARY KEY NOT NULL,
    state             TEXT NOT NULL CHECK(state IN ('created','initializing','ready','processing','error','terminated')),
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    health            TEXT NOT NULL,
    error_count       INTEGER NOT NULL DEFAULT 0,
    last_error        TEXT,
    last_error_reason TEXT,
    terminated_at     TEXT,
    revision          INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS work_item (
    id            TEXT PRIMARY KEY NOT NULL,
    session_id    TEXT NOT NULL,
    job_type      TEXT NOT NULL,
    payload       TEXT NOT NULL,
    status        TEXT NOT NULL CHECK(status IN ('pending','running','completed','failed')),
    created_at    TEXT NOT NULL,
    started_at    TEXT,
    completed_at  TEXT,
    progress      INTEGER NOT NULL DEFAULT 0 CHECK(progress BETWEEN 0 AND 100),
    error         TEXT,
    error_reason  TEXT,
    failed_step_id TEXT,
    archived      INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_work_item_session_status ON work_item(session_id, status);

CREATE TABLE IF NOT EXISTS execution (
    id                TEXT PRIMARY KEY NOT NULL,
    session_id        TEXT NOT NULL,
    work_item_id      TEXT,
    status            TEXT NOT NULL CHECK(status IN ('running','completed','failed')),
    current_step      TEXT,
    failed_step_id    TEXT,
    failed_step_name  TEXT,
    error             TEXT,
    reason            TEXT,
    result            TEXT,
    started_at        TEXT NOT NULL,
    completed_at      TEXT
);

CREATE TABLE IF NOT EXISTS execution_step (
    execution_id  TEXT NOT NULL,
    position      INTEGER NOT NULL,
    step_id       TEXT NOT NULL,
    name          TEXT NOT NULL,
    status        TEXT NOT NULL CHECK(status IN ('running','completed','failed')),
    result        TEXT,
    error         TEXT,
    started_at    TEXT NOT NULL,
    completed_at  TEXT,
    PRIMARY KEY (execution_id, position)
);

CREATE TABLE IF NOT EXISTS execution_log (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_id  TEXT NOT NULL,
    step_id       TEXT,
    level         TEXT NOT NULL CHECK(level IN ('info','error')),
    message       TEXT NOT NULL,
    fields        TEXT NOT NULL,
    timestamp     TEXT NOT NULL
);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
