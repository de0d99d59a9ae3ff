//! Completion detection behind one contract.
//!
//! Three imperfect strategies infer that a worker acknowledged or finished
//! a task: a sentinel marker file, a fresh output artifact, or an explicit
//! push through the `/signal` endpoint. The orchestrator only sees
//! [`CompletionSignal`]; which backend runs is configuration.

pub mod artifact;
pub mod marker;
pub mod tool_call;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use crate::config::{GlobalConfig, SignalBackend};
use crate::models::outcome::{Outcome, SignalKind};
use crate::process::BoxFuture;
use crate::registry::SessionRegistry;
use crate::Result;

pub use self::artifact::ArtifactSignal;
pub use self::marker::MarkerSignal;
pub use self::tool_call::ToolCallSignal;

/// Uniform wait interface over the detection backends.
pub trait CompletionSignal: Send + Sync {
    /// Backend name for logs and status output.
    fn name(&self) -> &'static str;

    /// Mark the start of a new operation for `session_id`.
    ///
    /// Must be called before work is sent to the worker. Clears any signal
    /// left over from a previous operation and records the start time used
    /// for freshness checks.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if stale state cannot be cleared.
    fn begin<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Wait for `kind` or until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SignalTimeout` when nothing was observed in time.
    /// The timeout never fires early.
    fn await_signal<'a>(
        &'a self,
        session_id: &'a str,
        kind: SignalKind,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Outcome>>;
}

/// Build the configured backend.
#[must_use]
pub fn from_config(
    config: &GlobalConfig,
    registry: Arc<SessionRegistry>,
) -> Arc<dyn CompletionSignal> {
    match config.signal.backend {
        SignalBackend::Marker => Arc::new(MarkerSignal::from_config(config)),
        SignalBackend::Artifact => Arc::new(ArtifactSignal::from_config(config)),
        SignalBackend::ToolCall => Arc::new(ToolCallSignal::new(registry)),
    }
}

/// Start time of the current operation per session.
#[derive(Debug, Default)]
pub(crate) struct OperationClock {
    starts: Mutex<HashMap<String, SystemTime>>,
}

impl OperationClock {
    pub(crate) fn start_at(&self, session_id: &str, at: SystemTime) {
        self.starts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.to_owned(), at);
    }

    /// Recorded start, or now if `begin` was never called.
    pub(crate) fn started(&self, session_id: &str) -> SystemTime {
        self.starts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .copied()
            .unwrap_or_else(SystemTime::now)
    }
}

/// Poll `check` every `interval` until it yields a value or `timeout` elapses.
pub(crate) async fn poll_until<T, F, Fut>(
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let polling = async {
        loop {
            if let Some(found) = check().await {
                return found;
            }
            tokio::time::sleep(interval).await;
        }
    };
    tokio::time::timeout(timeout, polling).await.ok()
}
