//! Worker health snapshot produced by the handshake prober.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of the most recent handshake probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HealthStatus {
    /// The OS process (or tmux session) is present.
    pub process_exists: bool,
    /// The process produced output after the probe was written.
    pub process_responsive: bool,
    /// The probe tag was echoed back.
    pub probe_succeeded: bool,
    /// When the probe completed.
    pub probe_timestamp: Option<DateTime<Utc>>,
    /// Descriptive failure detail.
    pub error: Option<String>,
}

impl HealthStatus {
    /// Status for a probe that observed its tag.
    #[must_use]
    pub fn healthy(at: DateTime<Utc>) -> Self {
        Self {
            process_exists: true,
            process_responsive: true,
            probe_succeeded: true,
            probe_timestamp: Some(at),
            error: None,
        }
    }

    /// Conjunction of the three probe booleans.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.process_exists && self.process_responsive && self.probe_succeeded
    }

    /// Merge the populated fields of `patch` into this status.
    pub fn apply(&mut self, patch: &HealthPatch) {
        if let Some(value) = patch.process_exists {
            self.process_exists = value;
        }
        if let Some(value) = patch.process_responsive {
            self.process_responsive = value;
        }
        if let Some(value) = patch.probe_succeeded {
            self.probe_succeeded = value;
        }
        if let Some(value) = patch.probe_timestamp {
            self.probe_timestamp = Some(value);
        }
        if let Some(value) = &patch.error {
            self.error.clone_from(value);
        }
    }
}

/// Partial health update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct HealthPatch {
    /// New `process_exists` value.
    pub process_exists: Option<bool>,
    /// New `process_responsive` value.
    pub process_responsive: Option<bool>,
    /// New `probe_succeeded` value.
    pub probe_succeeded: Option<bool>,
    /// New probe timestamp.
    pub probe_timestamp: Option<DateTime<Utc>>,
    /// `Some(None)` clears the error, `Some(Some(_))` replaces it.
    pub error: Option<Option<String>>,
}

