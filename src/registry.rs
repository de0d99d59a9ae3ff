//! In-memory per-session signal state and the wait primitive built on it.
//!
//! Each session has `watch` flags for acknowledgement, response, and error,
//! plus a progress generation counter. Setters flip the flags; waiters block
//! on them with an explicit timeout instead of polling. `reset` lowers every
//! flag, so a wait started afterwards can never observe a signal that
//! belonged to an earlier request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::debug;

use crate::models::outcome::{Outcome, SignalKind};
use crate::{AppError, Result};

/// Worker-reported failure.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReportedError {
    /// Failure detail.
    pub message: String,
    /// Whether the worker expects a retry to succeed.
    pub recoverable: bool,
}

/// Point-in-time view of a session's transient state.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SessionSnapshot {
    /// Worker acknowledged the current task.
    pub acked: bool,
    /// Latest progress percentage.
    pub progress: Option<u8>,
    /// Latest free-form status line.
    pub last_message: Option<String>,
    /// Latest response body.
    pub response: Option<String>,
    /// Completion outcome; `Some(true)` for success.
    pub completed: Option<bool>,
    /// Completion detail pushed with `complete`.
    pub completion_payload: Option<Value>,
    /// Worker-reported failure.
    pub error: Option<ReportedError>,
    /// Last mutation.
    pub updated_at: Option<DateTime<Utc>>,
}

struct Entry {
    state: Mutex<SessionSnapshot>,
    ack: watch::Sender<bool>,
    response: watch::Sender<bool>,
    failed: watch::Sender<bool>,
    progress: watch::Sender<u64>,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: Mutex::new(SessionSnapshot::default()),
            ack: watch::Sender::new(false),
            response: watch::Sender::new(false),
            failed: watch::Sender::new(false),
            progress: watch::Sender::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionSnapshot> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, change: impl FnOnce(&mut SessionSnapshot)) {
        let mut state = self.state();
        change(&mut state);
        state.updated_at = Some(Utc::now());
    }
}

/// Registry of transient state for every active session.
#[derive(Default)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<String, Arc<Entry>>>,
}

impl SessionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<Entry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, session_id: &str) -> Result<Arc<Entry>> {
        self.entries()
            .get(session_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} is not registered")))
    }

    /// Add a session. Registering twice keeps the existing state.
    pub fn register(&self, session_id: &str) {
        self.entries()
            .entry(session_id.to_owned())
            .or_insert_with(|| Arc::new(Entry::new()));
    }

    /// Drop a session's state. Waiters already blocked run until their timeout.
    pub fn remove(&self, session_id: &str) {
        self.entries().remove(session_id);
    }

    /// Whether a session is registered.
    #[must_use]
    pub fn contains(&self, session_id: &str) -> bool {
        self.entries().contains_key(session_id)
    }

    /// Registered session ids.
    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current transient state of a session.
    #[must_use]
    pub fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        let entry = self.entry(session_id).ok()?;
        let snapshot = entry.state().clone();
        Some(snapshot)
    }

    /// Record an acknowledgement and release acknowledgement waiters.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is not registered.
    pub fn set_ack(&self, session_id: &str) -> Result<()> {
        let entry = self.entry(session_id)?;
        entry.update(|state| state.acked = true);
        entry.ack.send_replace(true);
        Ok(())
    }

    /// Record a progress percentage, clamped to 100.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is not registered.
    pub fn set_progress(&self, session_id: &str, percent: u8) -> Result<()> {
        let entry = self.entry(session_id)?;
        entry.update(|state| state.progress = Some(percent.min(100)));
        entry.progress.send_modify(|generation| *generation += 1);
        Ok(())
    }

    /// Record a free-form status line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is not registered.
    pub fn set_status(&self, session_id: &str, message: &str) -> Result<()> {
        let entry = self.entry(session_id)?;
        entry.update(|state| state.last_message = Some(message.to_owned()));
        Ok(())
    }

    /// Record a response body and release response waiters.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is not registered.
    pub fn set_response(&self, session_id: &str, content: &str) -> Result<()> {
        let entry = self.entry(session_id)?;
        entry.update(|state| state.response = Some(content.to_owned()));
        entry.response.send_replace(true);
        Ok(())
    }

    /// Record completion and release response waiters.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is not registered.
    pub fn set_complete(&self, session_id: &str, success: bool, payload: Value) -> Result<()> {
        let entry = self.entry(session_id)?;
        entry.update(|state| {
            state.completed = Some(success);
            state.completion_payload = Some(payload);
        });
        entry.response.send_replace(true);
        Ok(())
    }

    /// Record a worker failure and release response and error waiters.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is not registered.
    pub fn set_error(&self, session_id: &str, message: &str, recoverable: bool) -> Result<()> {
        let entry = self.entry(session_id)?;
        entry.update(|state| {
            state.error = Some(ReportedError {
                message: message.to_owned(),
                recoverable,
            });
        });
        entry.failed.send_replace(true);
        entry.response.send_replace(true);
        Ok(())
    }

    /// Clear all transient state and lower every flag.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session is not registered.
    pub fn reset(&self, session_id: &str) -> Result<()> {
        let entry = self.entry(session_id)?;
        *entry.state() = SessionSnapshot::default();
        entry.ack.send_replace(false);
        entry.response.send_replace(false);
        entry.failed.send_replace(false);
        debug!(session_id, "registry state reset");
        Ok(())
    }

    /// Block until the worker acknowledges or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SignalTimeout` on timeout and `AppError::NotFound`
    /// if the session is not (or no longer) registered.
    pub async fn wait_for_ack(&self, session_id: &str, timeout: Duration) -> Result<Outcome> {
        let entry = self.entry(session_id)?;
        wait_flag(&entry.ack, session_id, SignalKind::Ack, timeout).await?;
        Ok(Outcome::new(SignalKind::Ack, json!({ "acked": true })))
    }

    /// Block until a response, completion, or error arrives, or `timeout` elapses.
    ///
    /// An error report yields an [`SignalKind::Error`] outcome; everything
    /// else yields [`SignalKind::Done`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::SignalTimeout` on timeout and `AppError::NotFound`
    /// if the session is not (or no longer) registered.
    pub async fn wait_for_response(&self, session_id: &str, timeout: Duration) -> Result<Outcome> {
        let entry = self.entry(session_id)?;
        wait_flag(&entry.response, session_id, SignalKind::Done, timeout).await?;
        let outcome = response_outcome(&entry.state());
        Ok(outcome)
    }

    /// Block until a worker error is reported or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SignalTimeout` on timeout and `AppError::NotFound`
    /// if the session is not (or no longer) registered.
    pub async fn wait_for_error(&self, session_id: &str, timeout: Duration) -> Result<Outcome> {
        let entry = self.entry(session_id)?;
        wait_flag(&entry.failed, session_id, SignalKind::Error, timeout).await?;
        let outcome = response_outcome(&entry.state());
        Ok(outcome)
    }

    /// Block until the next progress update or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SignalTimeout` on timeout and `AppError::NotFound`
    /// if the session is not (or no longer) registered.
    pub async fn wait_for_progress(&self, session_id: &str, timeout: Duration) -> Result<Outcome> {
        let entry = self.entry(session_id)?;
        let mut rx = entry.progress.subscribe();
        match tokio::time::timeout(timeout, rx.changed()).await {
            Ok(Ok(())) => {
                let percent = entry.state().progress;
                Ok(Outcome::new(
                    SignalKind::Progress,
                    json!({ "percent": percent }),
                ))
            }
            Ok(Err(_)) => Err(closed(session_id)),
            Err(_) => Err(timed_out(session_id, SignalKind::Progress, timeout)),
        }
    }
}

async fn wait_flag(
    flag: &watch::Sender<bool>,
    session_id: &str,
    kind: SignalKind,
    timeout: Duration,
) -> Result<()> {
    let mut rx = flag.subscribe();
    // The `watch::Ref` returned by `wait_for` borrows `rx`; drop it before `rx`.
    let waited = tokio::time::timeout(timeout, rx.wait_for(|raised| *raised))
        .await
        .map(|raised| raised.map(drop));
    match waited {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(closed(session_id)),
        Err(_) => Err(timed_out(session_id, kind, timeout)),
    }
}

fn response_outcome(state: &SessionSnapshot) -> Outcome {
    if let Some(error) = &state.error {
        return Outcome::new(
            SignalKind::Error,
            json!({ "message": error.message, "recoverable": error.recoverable }),
        );
    }
    Outcome::new(
        SignalKind::Done,
        json!({
            "success": state.completed.unwrap_or(true),
            "response": state.response,
            "detail": state.completion_payload,
        }),
    )
}

fn closed(session_id: &str) -> AppError {
    AppError::NotFound(format!("session {session_id} was removed while waiting"))
}

fn timed_out(session_id: &str, kind: SignalKind, timeout: Duration) -> AppError {
    AppError::SignalTimeout(format!(
        "no {} signal for session {session_id} within {timeout:?}",
        kind.as_str()
    ))
}
