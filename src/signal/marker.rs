//! Sentinel-file detection.
//!
//! The worker creates `markers/<kind>.marker` in its session directory.
//! Existence is the signal; the file body, if any, is passed through as
//! the payload. After a marker appears the waiter sleeps for the settle
//! delay so trailing output written just before the marker has a chance to
//! land. That delay narrows the race; it does not close it.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info};

use crate::config::GlobalConfig;
use crate::models::outcome::{Outcome, SignalKind};
use crate::process::BoxFuture;
use crate::storage::StorageHandle;
use crate::{AppError, Result};

use super::{poll_until, CompletionSignal};

const ALL_KINDS: [SignalKind; 4] = [
    SignalKind::Ack,
    SignalKind::Progress,
    SignalKind::Done,
    SignalKind::Error,
];

/// Marker-file backend.
#[derive(Debug, Clone)]
pub struct MarkerSignal {
    sessions_dir: PathBuf,
    poll_interval: Duration,
    settle_delay: Duration,
}

impl MarkerSignal {
    /// Backend with explicit settings.
    #[must_use]
    pub fn new(sessions_dir: PathBuf, poll_interval: Duration, settle_delay: Duration) -> Self {
        Self {
            sessions_dir,
            poll_interval,
            settle_delay,
        }
    }

    /// Backend configured from `[signal]`.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::new(
            config.sessions_dir(),
            Duration::from_millis(config.signal.poll_interval_ms),
            Duration::from_millis(config.signal.settle_delay_ms),
        )
    }

    fn storage(&self, session_id: &str) -> StorageHandle {
        StorageHandle::new(&self.sessions_dir, session_id)
    }
}

async fn marker_outcome(kind: SignalKind, path: PathBuf) -> Outcome {
    let content = tokio::fs::read_to_string(&path).await.unwrap_or_default();
    Outcome::new(
        kind,
        json!({
            "marker": path.to_string_lossy(),
            "content": content.trim(),
        }),
    )
}

impl CompletionSignal for MarkerSignal {
    fn name(&self) -> &'static str {
        "marker"
    }

    fn begin<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let storage = self.storage(session_id);
            tokio::fs::create_dir_all(storage.markers_dir()).await?;
            for kind in ALL_KINDS {
                match tokio::fs::remove_file(storage.marker_path(kind)).await {
                    Ok(()) => debug!(session_id, kind = kind.as_str(), "stale marker removed"),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
            Ok(())
        })
    }

    fn await_signal<'a>(
        &'a self,
        session_id: &'a str,
        kind: SignalKind,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move {
            let storage = self.storage(session_id);
            let wanted = storage.marker_path(kind);
            // A completion wait also ends on an error marker.
            let failure = (kind == SignalKind::Done).then(|| storage.marker_path(SignalKind::Error));

            let found = poll_until(timeout, self.poll_interval, || {
                let wanted = wanted.clone();
                let failure = failure.clone();
                async move {
                    if tokio::fs::try_exists(&wanted).await.unwrap_or(false) {
                        return Some((kind, wanted));
                    }
                    match failure {
                        Some(path) if tokio::fs::try_exists(&path).await.unwrap_or(false) => {
                            Some((SignalKind::Error, path))
                        }
                        _ => None,
                    }
                }
            })
            .await;

            let Some((observed, path)) = found else {
                return Err(AppError::SignalTimeout(format!(
                    "no {} marker for session {session_id} within {timeout:?}",
                    kind.as_str()
                )));
            };

            tokio::time::sleep(self.settle_delay).await;
            info!(session_id, kind = observed.as_str(), "marker observed");
            Ok(marker_outcome(observed, path).await)
        })
    }
}
