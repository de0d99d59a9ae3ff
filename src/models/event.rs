//! Events fanned out to session observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of a broadcast event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Worker acknowledged a task.
    Ack,
    /// Worker progress percentage.
    Progress,
    /// Free-form status line from the worker.
    Status,
    /// Worker response body.
    Response,
    /// Worker finished a task.
    Complete,
    /// Terminal failure with reason and detail.
    Error,
    /// Session lifecycle change.
    SessionState,
    /// A pipeline step began.
    StepStarted,
    /// A pipeline step finished.
    StepCompleted,
    /// A pipeline run finished successfully.
    PipelineCompleted,
    /// A stale work item was reclaimed.
    ItemReclaimed,
    /// Registry wait state was cleared.
    Reset,
}

/// One event in a session's stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct BroadcastEvent {
    /// Session the event belongs to.
    pub session_id: String,
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Event-specific detail.
    #[serde(default)]
    pub fields: Map<String, Value>,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl BroadcastEvent {
    /// Build an event with no fields, stamped now.
    #[must_use]
    pub fn new(session_id: impl Into<String>, event_type: EventType) -> Self {
        Self {
            session_id: session_id.into(),
            event_type,
            fields: Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach a field.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_owned(), value.into());
        self
    }

    /// Serialized size in bytes, used by the history byte budget.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map_or(0, |bytes| bytes.len())
    }
}
