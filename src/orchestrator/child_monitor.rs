//! Child process monitor: detects workers that exit on their own.
//!
//! Periodically polls every attached handle. A handle whose process has
//! exited is detached, its session moved to `error` with reason
//! `process_exited`, and observers receive an `error` event.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::orchestrator::session_manager::SessionManager;

/// Interval between polls for worker exits.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Reason recorded for a worker that exited without being asked to.
pub const REASON_PROCESS_EXITED: &str = "process_exited";

/// Spawn the monitor. Polls at `interval` until `cancel` fires.
#[must_use]
pub fn spawn_child_monitor(
    sessions: Arc<SessionManager>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("child process monitor shutting down");
                        break;
                    }
                    () = tokio::time::sleep(interval) => {}
                }

                poll_children(&sessions).await;
            }
        }
        .instrument(info_span!("child_monitor")),
    )
}

/// Check every attached worker once. Returns the sessions whose worker
/// was found dead.
pub async fn poll_children(sessions: &SessionManager) -> Vec<String> {
    let mut exited = Vec::new();
    for (session_id, handle) in sessions.live_handles() {
        if !handle.is_alive().await {
            exited.push((session_id, handle));
        }
    }

    let mut reported = Vec::new();
    for (session_id, handle) in exited {
        // Someone else may have replaced or stopped the worker meanwhile.
        if !sessions.detach_if_current(&session_id, &handle) {
            continue;
        }
        info!(session_id = %session_id, "worker process exited");

        if let Err(err) = sessions
            .record_error(&session_id, "worker process exited unexpectedly", REASON_PROCESS_EXITED)
            .await
        {
            warn!(session_id = %session_id, %err, "failed to record worker exit");
        }
        reported.push(session_id);
    }
    reported
}
