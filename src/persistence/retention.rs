//! Retention service for time-based data purge.
//!
//! Runs as a background task deleting children first (execution logs,
//! steps, executions, archived work items), then terminated sessions whose
//! `terminated_at` is older than `retention_days`, then their journal files
//! and session directories.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::db::Database;
use super::ts;
use crate::broadcast::journal::EventJournal;
use crate::storage::StorageHandle;
use crate::Result;

const PURGE_INTERVAL: Duration = Duration::from_secs(3600);

/// Counts removed by one purge pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    /// Terminated sessions deleted.
    pub sessions: u64,
    /// Executions deleted.
    pub executions: u64,
    /// Work items deleted.
    pub work_items: u64,
}

/// Where purged sessions keep files outside the database.
#[derive(Debug, Clone)]
pub struct RetentionFiles {
    /// Per-session directories root.
    pub sessions_dir: PathBuf,
    /// Broadcast journal, if persistence is enabled.
    pub journal: Option<EventJournal>,
}

/// Spawn the retention purge background task.
///
/// The task runs hourly. On each tick it deletes all associated records
/// for sessions that have been terminated for longer than `retention_days`.
#[must_use]
pub fn spawn_retention_task(
    db: Arc<Database>,
    retention_days: u32,
    files: RetentionFiles,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
                    if let Err(err) = purge(&db, cutoff, &files).await {
                        error!(%err, "retention purge failed");
                    }
                }
            }
        }
    })
}

/// Delete everything belonging to sessions terminated before `cutoff`,
/// plus archived work items finished before it.
///
/// # Errors
///
/// Returns `AppError::Db` if a delete fails. File removal failures are
/// logged and skipped.
pub async fn purge(db: &Database, cutoff: DateTime<Utc>, files: &RetentionFiles) -> Result<PurgeReport> {
    let cutoff = ts(cutoff);

    let expired: Vec<String> = sqlx::query_scalar(
        "SELECT id FROM session WHERE state = 'terminated' AND terminated_at < ?1",
    )
    .bind(&cutoff)
    .fetch_all(db)
    .await?;

    let mut tx = db.begin().await?;

    // Children first.
    for table in ["execution_log", "execution_step"] {
        // `table` is one of the literals above, never user input.
        let query = format!(
            "DELETE FROM {table} WHERE execution_id IN \
             (SELECT e.id FROM execution e JOIN session s ON s.id = e.session_id \
              WHERE s.state = 'terminated' AND s.terminated_at < ?1)"
        );
        sqlx::query(&query).bind(&cutoff).execute(&mut *tx).await?;
    }

    let executions = sqlx::query(
        "DELETE FROM execution WHERE session_id IN \
         (SELECT id FROM session WHERE state = 'terminated' AND terminated_at < ?1)",
    )
    .bind(&cutoff)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let work_items = sqlx::query(
        "DELETE FROM work_item WHERE \
         session_id IN (SELECT id FROM session WHERE state = 'terminated' AND terminated_at < ?1) \
         OR (archived = 1 AND completed_at < ?1)",
    )
    .bind(&cutoff)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    let sessions = sqlx::query(
        "DELETE FROM session WHERE state = 'terminated' AND terminated_at < ?1",
    )
    .bind(&cutoff)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    tx.commit().await?;

    for session_id in &expired {
        remove_files(session_id, files).await;
    }

    let report = PurgeReport {
        sessions,
        executions,
        work_items,
    };
    info!(
        sessions = report.sessions,
        executions = report.executions,
        work_items = report.work_items,
        "retention purge completed"
    );
    Ok(report)
}

async fn remove_files(session_id: &str, files: &RetentionFiles) {
    if let Some(journal) = &files.journal {
        if let Err(err) = journal.remove(session_id) {
            warn!(session_id, %err, "failed to remove session journal");
        }
    }
    let storage = StorageHandle::new(&files.sessions_dir, session_id);
    match tokio::fs::remove_dir_all(&storage.root).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(session_id, %err, "failed to remove session directory"),
    }
}
