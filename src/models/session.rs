//! Session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::health::HealthStatus;

/// Lifecycle state for a supervised worker session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Storage exists but no worker has been spawned yet.
    Created,
    /// A worker is being spawned and probed.
    Initializing,
    /// Worker passed its handshake and is idle.
    Ready,
    /// Worker is executing a pipeline run.
    Processing,
    /// Worker failed; recoverable by respawn.
    Error,
    /// Session torn down explicitly.
    Terminated,
}

impl SessionState {
    /// Whether the state accepts no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Terminated
    }
}

/// Session domain entity persisted in `SQLite`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Externally supplied opaque identifier.
    pub id: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Last-known health, replaced wholesale on each probe.
    pub health: HealthStatus,
    /// Number of times the session entered the error state.
    pub error_count: u32,
    /// Human-readable detail for the most recent error.
    pub last_error: Option<String>,
    /// Machine-checkable reason code for the most recent error.
    pub last_error_reason: Option<String>,
    /// Set when the session reaches `terminated`.
    pub terminated_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Construct a freshly created session.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            state: SessionState::Created,
            created_at: now,
            updated_at: now,
            health: HealthStatus::default(),
            error_count: 0,
            last_error: None,
            last_error_reason: None,
            terminated_at: None,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// `error` is reachable from every non-terminal state and recovers
    /// through `initializing`.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::{Created, Error, Initializing, Processing, Ready, Terminated};

        if self.state.is_terminal() {
            return false;
        }

        matches!(
            (self.state, next),
            (Created | Error, Initializing)
                | (Initializing | Processing, Ready)
                | (Ready, Processing)
                | (Created | Initializing | Ready | Processing, Error)
                | (_, Terminated)
        )
    }
}

