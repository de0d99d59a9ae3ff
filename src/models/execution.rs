//! Pipeline execution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status shared by executions and their steps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// In flight.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

/// Identity of the step that aborted a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct FailedStep {
    /// Step identifier.
    pub id: String,
    /// Step display name.
    pub name: String,
}

/// One pipeline run against a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Execution {
    /// Unique record identifier.
    pub id: String,
    /// Target session.
    pub session_id: String,
    /// Work item that triggered the run, if any.
    pub work_item_id: Option<String>,
    /// Run status.
    pub status: RunStatus,
    /// Step currently executing.
    pub current_step: Option<String>,
    /// Step that aborted the run.
    pub failed_step: Option<FailedStep>,
    /// Failure detail.
    pub error: Option<String>,
    /// Machine-checkable failure reason.
    pub reason: Option<String>,
    /// Collected step results keyed by step id.
    pub result: Option<serde_json::Value>,
    /// Start timestamp.
    pub started_at: DateTime<Utc>,
    /// End timestamp.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// Construct a running execution with a generated identifier.
    #[must_use]
    pub fn new(session_id: impl Into<String>, work_item_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            work_item_id,
            status: RunStatus::Running,
            current_step: None,
            failed_step: None,
            error: None,
            reason: None,
            result: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Persisted state of one step within an execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct StepRecord {
    /// Owning execution.
    pub execution_id: String,
    /// Position within the run.
    pub position: u32,
    /// Step identifier.
    pub step_id: String,
    /// Step display name.
    pub name: String,
    /// Step status.
    pub status: RunStatus,
    /// Result payload on success.
    pub result: Option<serde_json::Value>,
    /// Failure detail.
    pub error: Option<String>,
    /// Start timestamp.
    pub started_at: DateTime<Utc>,
    /// End timestamp.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Severity of an execution log entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Normal progress.
    Info,
    /// Step or run failure.
    Error,
}

/// Structured log line attached to an execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ExecutionLogEntry {
    /// Owning execution.
    pub execution_id: String,
    /// Step the entry refers to, if any.
    pub step_id: Option<String>,
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
    /// Extra structured detail.
    pub fields: serde_json::Value,
    /// Entry timestamp.
    pub timestamp: DateTime<Utc>,
}
