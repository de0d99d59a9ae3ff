//! Work-item queue repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::work_item::{JobPayload, WorkFailure, WorkItem, WorkStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_opt_ts, parse_ts, ts};

/// Repository wrapper around `SQLite` for queued work items.
#[derive(Clone)]
pub struct WorkItemRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: String,
    session_id: String,
    payload: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    progress: i64,
    error: Option<String>,
    error_reason: Option<String>,
    failed_step_id: Option<String>,
    archived: i64,
}

impl WorkItemRow {
    fn into_item(self) -> Result<WorkItem> {
        let payload: JobPayload = serde_json::from_str(&self.payload)
            .map_err(|e| AppError::Db(format!("invalid payload: {e}")))?;
        Ok(WorkItem {
            id: self.id,
            session_id: self.session_id,
            payload,
            status: parse_status(&self.status)?,
            created_at: parse_ts("created_at", &self.created_at)?,
            started_at: parse_opt_ts("started_at", self.started_at.as_deref())?,
            completed_at: parse_opt_ts("completed_at", self.completed_at.as_deref())?,
            progress: u8::try_from(self.progress.clamp(0, 100)).unwrap_or(0),
            error: self.error,
            error_reason: self.error_reason,
            failed_step_id: self.failed_step_id,
            archived: self.archived != 0,
        })
    }
}

fn parse_status(s: &str) -> Result<WorkStatus> {
    match s {
        "pending" => Ok(WorkStatus::Pending),
        "running" => Ok(WorkStatus::Running),
        "completed" => Ok(WorkStatus::Completed),
        "failed" => Ok(WorkStatus::Failed),
        other => Err(AppError::Db(format!("invalid work status: {other}"))),
    }
}

fn status_str(s: WorkStatus) -> &'static str {
    match s {
        WorkStatus::Pending => "pending",
        WorkStatus::Running => "running",
        WorkStatus::Completed => "completed",
        WorkStatus::Failed => "failed",
    }
}

/// Running-slot usage for one session.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SlotUsage {
    /// Session identifier.
    pub session_id: String,
    /// Items currently running.
    pub running: u32,
    /// Items waiting.
    pub pending: u32,
}

impl WorkItemRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a work item.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn enqueue(&self, item: &WorkItem) -> Result<WorkItem> {
        let payload = serde_json::to_string(&item.payload)?;

        sqlx::query(
            "INSERT INTO work_item (id, session_id, job_type, payload, status, created_at,
             started_at, completed_at, progress, error, error_reason, failed_step_id, archived)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(&item.id)
        .bind(&item.session_id)
        .bind(item.job_type())
        .bind(&payload)
        .bind(status_str(item.status))
        .bind(ts(item.created_at))
        .bind(item.started_at.map(ts))
        .bind(item.completed_at.map(ts))
        .bind(i64::from(item.progress))
        .bind(&item.error)
        .bind(&item.error_reason)
        .bind(&item.failed_step_id)
        .bind(i64::from(item.archived))
        .execute(self.db.as_ref())
        .await?;

        Ok(item.clone())
    }

    /// Retrieve a work item by identifier, if present.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<WorkItem>> {
        let row: Option<WorkItemRow> = sqlx::query_as("SELECT * FROM work_item WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(WorkItemRow::into_item).transpose()
    }

    /// Pending, non-archived items in enqueue order, for one session or all.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn find_pending(&self, session_id: Option<&str>) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(
            "SELECT * FROM work_item
             WHERE status = 'pending' AND archived = 0 AND (?1 IS NULL OR session_id = ?1)
             ORDER BY created_at, id",
        )
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(WorkItemRow::into_item).collect()
    }

    /// All non-archived items of a session, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(
            "SELECT * FROM work_item WHERE session_id = ?1 AND archived = 0
             ORDER BY created_at DESC, id",
        )
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(WorkItemRow::into_item).collect()
    }

    /// Number of running items for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn running_count(&self, session_id: &str) -> Result<u32> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM work_item WHERE session_id = ?1 AND status = 'running'",
        )
        .bind(session_id)
        .fetch_one(self.db.as_ref())
        .await?;
        Ok(u32::try_from(row.0).unwrap_or(u32::MAX))
    }

    /// `max(0, limit - running)` for a session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn available_slots(&self, session_id: &str, limit: u32) -> Result<u32> {
        Ok(limit.saturating_sub(self.running_count(session_id).await?))
    }

    /// Running and pending counts per session that has either.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn slot_usage(&self) -> Result<Vec<SlotUsage>> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            "SELECT session_id,
                    SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN status = 'pending' AND archived = 0 THEN 1 ELSE 0 END)
             FROM work_item
             WHERE status IN ('running', 'pending')
             GROUP BY session_id
             ORDER BY session_id",
        )
        .fetch_all(self.db.as_ref())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(session_id, running, pending)| SlotUsage {
                session_id,
                running: u32::try_from(running).unwrap_or(u32::MAX),
                pending: u32::try_from(pending).unwrap_or(u32::MAX),
            })
            .collect())
    }

    /// Claim a pending item if its session has a free slot.
    ///
    /// The status check and the slot count are evaluated inside a single
    /// `UPDATE`, so two claimers can never both exceed `limit`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn try_claim(&self, id: &str, limit: u32) -> Result<bool> {
        let claimed = sqlx::query(
            "UPDATE work_item SET status = 'running', started_at = ?1
             WHERE id = ?2 AND status = 'pending'
               AND (SELECT COUNT(*) FROM work_item AS other
                    WHERE other.session_id = work_item.session_id
                      AND other.status = 'running') < ?3",
        )
        .bind(ts(Utc::now()))
        .bind(id)
        .bind(i64::from(limit))
        .execute(self.db.as_ref())
        .await?
        .rows_affected();

        Ok(claimed == 1)
    }

    /// Record progress on a running item.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn update_progress(&self, id: &str, progress: u8) -> Result<()> {
        sqlx::query("UPDATE work_item SET progress = ?1 WHERE id = ?2 AND status = 'running'")
            .bind(i64::from(progress.min(100)))
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Mark a running item completed. Returns `false` if it was no longer running.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn complete(&self, id: &str) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE work_item SET status = 'completed', progress = 100, completed_at = ?1
             WHERE id = ?2 AND status = 'running'",
        )
        .bind(ts(Utc::now()))
        .bind(id)
        .execute(self.db.as_ref())
        .await?
        .rows_affected();
        Ok(done == 1)
    }

    /// Mark a running item failed. Returns `false` if it was no longer running.
    ///
    /// Also used for stale reclamation: the conditional update means a
    /// reclaim racing a normal completion resolves to exactly one winner.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn fail(&self, id: &str, failure: &WorkFailure) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE work_item SET status = 'failed', error = ?1, error_reason = ?2,
             failed_step_id = ?3, completed_at = ?4
             WHERE id = ?5 AND status = 'running'",
        )
        .bind(&failure.message)
        .bind(&failure.reason)
        .bind(&failure.failed_step_id)
        .bind(ts(Utc::now()))
        .bind(id)
        .execute(self.db.as_ref())
        .await?
        .rows_affected();
        Ok(done == 1)
    }

    /// Running items whose `started_at` is older than `now - timeout`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn find_stale(
        &self,
        session_id: Option<&str>,
        timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>> {
        let cutoff = ts(now - timeout);
        let rows: Vec<WorkItemRow> = sqlx::query_as(
            "SELECT * FROM work_item
             WHERE status = 'running' AND started_at IS NOT NULL AND started_at < ?1
               AND (?2 IS NULL OR session_id = ?2)
             ORDER BY started_at",
        )
        .bind(&cutoff)
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(WorkItemRow::into_item).collect()
    }

    /// Fail every running item, used at startup when no worker survived a restart.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn fail_all_running(&self, failure: &WorkFailure) -> Result<u64> {
        let done = sqlx::query(
            "UPDATE work_item SET status = 'failed', error = ?1, error_reason = ?2,
             failed_step_id = ?3, completed_at = ?4
             WHERE status = 'running'",
        )
        .bind(&failure.message)
        .bind(&failure.reason)
        .bind(&failure.failed_step_id)
        .bind(ts(Utc::now()))
        .execute(self.db.as_ref())
        .await?
        .rows_affected();
        Ok(done)
    }

    /// Archive the finished items of a session so they drop out of listings.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn archive_finished(&self, session_id: &str) -> Result<u64> {
        let done = sqlx::query(
            "UPDATE work_item SET archived = 1
             WHERE session_id = ?1 AND archived = 0 AND status IN ('completed', 'failed')",
        )
        .bind(session_id)
        .execute(self.db.as_ref())
        .await?
        .rows_affected();
        Ok(done)
    }
}
