//! Pipeline execution repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::Utc;

use crate::models::execution::{
    Execution, ExecutionLogEntry, FailedStep, LogLevel, RunStatus, StepRecord,
};
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_opt_ts, parse_ts, ts};

/// Repository wrapper around `SQLite` for executions, their steps, and logs.
#[derive(Clone)]
pub struct ExecutionRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    session_id: String,
    work_item_id: Option<String>,
    status: String,
    current_step: Option<String>,
    failed_step_id: Option<String>,
    failed_step_name: Option<String>,
    error: Option<String>,
    reason: Option<String>,
    result: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl ExecutionRow {
    fn into_execution(self) -> Result<Execution> {
        let failed_step = match (self.failed_step_id, self.failed_step_name) {
            (Some(id), Some(name)) => Some(FailedStep { id, name }),
            _ => None,
        };
        Ok(Execution {
            id: self.id,
            session_id: self.session_id,
            work_item_id: self.work_item_id,
            status: parse_status(&self.status)?,
            current_step: self.current_step,
            failed_step,
            error: self.error,
            reason: self.reason,
            result: parse_json(self.result.as_deref())?,
            started_at: parse_ts("started_at", &self.started_at)?,
            completed_at: parse_opt_ts("completed_at", self.completed_at.as_deref())?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StepRow {
    execution_id: String,
    position: i64,
    step_id: String,
    name: String,
    status: String,
    result: Option<String>,
    error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl StepRow {
    fn into_record(self) -> Result<StepRecord> {
        Ok(StepRecord {
            execution_id: self.execution_id,
            position: u32::try_from(self.position).unwrap_or(0),
            step_id: self.step_id,
            name: self.name,
            status: parse_status(&self.status)?,
            result: parse_json(self.result.as_deref())?,
            error: self.error,
            started_at: parse_ts("started_at", &self.started_at)?,
            completed_at: parse_opt_ts("completed_at", self.completed_at.as_deref())?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    execution_id: String,
    step_id: Option<String>,
    level: String,
    message: String,
    fields: String,
    timestamp: String,
}

impl LogRow {
    fn into_entry(self) -> Result<ExecutionLogEntry> {
        let level = match self.level.as_str() {
            "info" => LogLevel::Info,
            "error" => LogLevel::Error,
            other => return Err(AppError::Db(format!("invalid log level: {other}"))),
        };
        Ok(ExecutionLogEntry {
            execution_id: self.execution_id,
            step_id: self.step_id,
            level,
            message: self.message,
            fields: serde_json::from_str(&self.fields)
                .map_err(|e| AppError::Db(format!("invalid log fields: {e}")))?,
            timestamp: parse_ts("timestamp", &self.timestamp)?,
        })
    }
}

fn parse_status(s: &str) -> Result<RunStatus> {
    match s {
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        other => Err(AppError::Db(format!("invalid run status: {other}"))),
    }
}

fn status_str(s: RunStatus) -> &'static str {
    match s {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
    }
}

fn parse_json(raw: Option<&str>) -> Result<Option<serde_json::Value>> {
    raw.map(|s| {
        serde_json::from_str(s).map_err(|e| AppError::Db(format!("invalid result json: {e}")))
    })
    .transpose()
}

fn json_str(value: Option<&serde_json::Value>) -> Result<Option<String>> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map_err(AppError::from)
}

impl ExecutionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new execution record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn create(&self, execution: &Execution) -> Result<Execution> {
        sqlx::query(
            "INSERT INTO execution (id, session_id, work_item_id, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&execution.id)
        .bind(&execution.session_id)
        .bind(&execution.work_item_id)
        .bind(status_str(execution.status))
        .bind(ts(execution.started_at))
        .execute(self.db.as_ref())
        .await?;
        Ok(execution.clone())
    }

    /// Retrieve an execution by identifier, if present.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Execution>> {
        let row: Option<ExecutionRow> = sqlx::query_as("SELECT * FROM execution WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(ExecutionRow::into_execution).transpose()
    }

    /// Executions of a session, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<Execution>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(
            "SELECT * FROM execution WHERE session_id = ?1 ORDER BY started_at DESC",
        )
        .bind(session_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    /// Persist a step as running and point the execution at it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if either write fails.
    pub async fn start_step(
        &self,
        execution_id: &str,
        position: u32,
        step_id: &str,
        name: &str,
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO execution_step
             (execution_id, position, step_id, name, status, started_at)
             VALUES (?1, ?2, ?3, ?4, 'running', ?5)",
        )
        .bind(execution_id)
        .bind(i64::from(position))
        .bind(step_id)
        .bind(name)
        .bind(ts(Utc::now()))
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE execution SET current_step = ?1 WHERE id = ?2")
            .bind(step_id)
            .bind(execution_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Persist a step as completed with its result.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn complete_step(
        &self,
        execution_id: &str,
        position: u32,
        result: Option<&serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE execution_step SET status = 'completed', result = ?1, completed_at = ?2
             WHERE execution_id = ?3 AND position = ?4",
        )
        .bind(json_str(result)?)
        .bind(ts(Utc::now()))
        .bind(execution_id)
        .bind(i64::from(position))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Persist a step as failed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn fail_step(&self, execution_id: &str, position: u32, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE execution_step SET status = 'failed', error = ?1, completed_at = ?2
             WHERE execution_id = ?3 AND position = ?4",
        )
        .bind(error)
        .bind(ts(Utc::now()))
        .bind(execution_id)
        .bind(i64::from(position))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Steps of an execution in run order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn steps(&self, execution_id: &str) -> Result<Vec<StepRecord>> {
        let rows: Vec<StepRow> = sqlx::query_as(
            "SELECT * FROM execution_step WHERE execution_id = ?1 ORDER BY position",
        )
        .bind(execution_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(StepRow::into_record).collect()
    }

    /// Mark an execution completed with its collected result.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn complete(&self, id: &str, result: Option<&serde_json::Value>) -> Result<()> {
        sqlx::query(
            "UPDATE execution SET status = 'completed', current_step = NULL, result = ?1,
             completed_at = ?2 WHERE id = ?3",
        )
        .bind(json_str(result)?)
        .bind(ts(Utc::now()))
        .bind(id)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Mark an execution failed with the aborting step and reason.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn fail(
        &self,
        id: &str,
        failed_step: Option<&FailedStep>,
        error: &str,
        reason: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE execution SET status = 'failed', failed_step_id = ?1, failed_step_name = ?2,
             error = ?3, reason = ?4, completed_at = ?5 WHERE id = ?6",
        )
        .bind(failed_step.map(|s| s.id.as_str()))
        .bind(failed_step.map(|s| s.name.as_str()))
        .bind(error)
        .bind(reason)
        .bind(ts(Utc::now()))
        .bind(id)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Append a structured log entry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn append_log(&self, entry: &ExecutionLogEntry) -> Result<()> {
        let level = match entry.level {
            LogLevel::Info => "info",
            LogLevel::Error => "error",
        };
        sqlx::query(
            "INSERT INTO execution_log (execution_id, step_id, level, message, fields, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&entry.execution_id)
        .bind(&entry.step_id)
        .bind(level)
        .bind(&entry.message)
        .bind(serde_json::to_string(&entry.fields)?)
        .bind(ts(entry.timestamp))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Log entries of an execution in append order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn logs(&self, execution_id: &str) -> Result<Vec<ExecutionLogEntry>> {
        let rows: Vec<LogRow> = sqlx::query_as(
            "SELECT execution_id, step_id, level, message, fields, timestamp
             FROM execution_log WHERE execution_id = ?1 ORDER BY id",
        )
        .bind(execution_id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(LogRow::into_entry).collect()
    }
}
