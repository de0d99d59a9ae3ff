//! Completion-signal outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which signal a waiter is interested in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Worker acknowledged the task.
    Ack,
    /// Worker reported intermediate progress.
    Progress,
    /// Worker finished.
    Done,
    /// Worker reported a failure.
    Error,
}

impl SignalKind {
    /// Lowercase wire name, also used for marker file names.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Progress => "progress",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

/// An observed completion signal. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Outcome {
    /// Which signal fired.
    pub kind: SignalKind,
    /// Backend-specific detail (marker contents, artifact metadata, pushed payload).
    pub payload: serde_json::Value,
    /// When the waiter observed the signal.
    pub observed_at: DateTime<Utc>,
}

impl Outcome {
    /// Build an outcome stamped now.
    #[must_use]
    pub fn new(kind: SignalKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            observed_at: Utc::now(),
        }
    }

    /// Whether the worker reported failure through this outcome.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.kind == SignalKind::Error
            || self
                .payload
                .get("success")
                .and_then(serde_json::Value::as_bool)
                == Some(false)
    }
}
