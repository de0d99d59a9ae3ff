//! Persisted job-queue entries and their payloads.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue status for a work item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Waiting for a free slot.
    Pending,
    /// Claimed by the monitor; occupies one slot.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error, or reclaimed as stale.
    Failed,
}

impl WorkStatus {
    /// Whether the item has left the active set.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Closed set of job kinds the orchestrator knows how to run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// Render a prompt template and hand it to the worker.
    Prompt {
        /// Template identifier passed to the renderer.
        template_id: String,
        /// Template variables.
        #[serde(default)]
        variables: BTreeMap<String, String>,
    },
    /// Deploy a build output and verify it responds.
    Deploy {
        /// Directory or archive to deploy.
        source_path: PathBuf,
    },
    /// Replace an existing deployment.
    Redeploy {
        /// Directory or archive to deploy.
        source_path: PathBuf,
        /// URL of the existing deployment.
        url: String,
    },
    /// Health-check an existing deployment.
    Verify {
        /// URL to check.
        url: String,
    },
}

impl JobPayload {
    /// Stable type name stored alongside the payload.
    #[must_use]
    pub fn job_type(&self) -> &'static str {
        match self {
            Self::Prompt { .. } => "prompt",
            Self::Deploy { .. } => "deploy",
            Self::Redeploy { .. } => "redeploy",
            Self::Verify { .. } => "verify",
        }
    }
}

/// Reason recorded when the monitor reclaims an item that ran too long.
pub const REASON_STALE_WORK: &str = "stale_work";

/// Reason recorded when an operator reclaims an item.
pub const REASON_RECLAIMED: &str = "reclaimed";

/// Reason recorded for items that were running when the server stopped.
pub const REASON_INTERRUPTED: &str = "interrupted";

/// Why a work item failed: a message for people plus a reason code and
/// optional step id for machines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkFailure {
    /// Human-readable detail.
    pub message: String,
    /// Stable reason code.
    pub reason: String,
    /// Step that failed, if any.
    pub failed_step_id: Option<String>,
}

impl WorkFailure {
    /// Failure not tied to a step.
    #[must_use]
    pub fn new(message: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            reason: reason.into(),
            failed_step_id: None,
        }
    }

    /// Attribute the failure to a step.
    #[must_use]
    pub fn at_step(mut self, step_id: Option<String>) -> Self {
        self.failed_step_id = step_id;
        self
    }
}

/// One queued unit of work for a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkItem {
    /// Unique record identifier.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// What to run.
    pub payload: JobPayload,
    /// Queue status.
    pub status: WorkStatus,
    /// Enqueue timestamp; dispatch order.
    pub created_at: DateTime<Utc>,
    /// When the item was claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// When the item finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Percentage complete, `0..=100`.
    pub progress: u8,
    /// Failure detail.
    pub error: Option<String>,
    /// Machine-checkable failure reason, e.g. `step_failure` or `stale_work`.
    pub error_reason: Option<String>,
    /// Step that failed, when a pipeline step ended the run.
    pub failed_step_id: Option<String>,
    /// Hidden from listings after a cleanup pass.
    pub archived: bool,
}

impl WorkItem {
    /// Construct a pending item with a generated identifier.
    #[must_use]
    pub fn new(session_id: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            payload,
            status: WorkStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0,
            error: None,
            error_reason: None,
            failed_step_id: None,
            archived: false,
        }
    }

    /// Stable type name of the payload.
    #[must_use]
    pub fn job_type(&self) -> &'static str {
        self.payload.job_type()
    }
}

