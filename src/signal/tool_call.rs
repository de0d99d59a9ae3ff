//! Push-based detection through the session registry.
//!
//! The worker calls the `/signal` endpoint, which flips the registry's
//! flags; the waiter blocks on those flags rather than polling.

use std::sync::Arc;
use std::time::Duration;

use crate::models::outcome::{Outcome, SignalKind};
use crate::process::BoxFuture;
use crate::registry::SessionRegistry;
use crate::Result;

use super::CompletionSignal;

/// Tool-call backend.
pub struct ToolCallSignal {
    registry: Arc<SessionRegistry>,
}

impl ToolCallSignal {
    /// Backend waiting on `registry`.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

impl CompletionSignal for ToolCallSignal {
    fn name(&self) -> &'static str {
        "tool_call"
    }

    fn begin<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.registry.register(session_id);
            self.registry.reset(session_id)
        })
    }

    fn await_signal<'a>(
        &'a self,
        session_id: &'a str,
        kind: SignalKind,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move {
            match kind {
                SignalKind::Ack => self.registry.wait_for_ack(session_id, timeout).await,
                SignalKind::Progress => self.registry.wait_for_progress(session_id, timeout).await,
                SignalKind::Done => self.registry.wait_for_response(session_id, timeout).await,
                SignalKind::Error => self.registry.wait_for_error(session_id, timeout).await,
            }
        })
    }
}
