//! Output-artifact detection.
//!
//! The worker writes its result to `output/<artifact_name>`. A file only
//! counts when it exists, was modified at or after the operation start, and
//! is at least `min_artifact_bytes` long; a leftover from an earlier run is
//! never accepted. Acknowledgement is any fresh artifact regardless of size,
//! progress reports the current size, and failure is a fresh
//! `<artifact_name>.error` file.
//!
//! The operation start is read back from a stamp file written by `begin`,
//! so it comes from the same file-system clock that stamps the artifact.
//! The wall clock can run ahead of that coarser clock by a tick, which
//! would otherwise make a file written right after `begin` look stale.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde_json::json;
use tracing::info;

use crate::config::GlobalConfig;
use crate::models::outcome::{Outcome, SignalKind};
use crate::process::BoxFuture;
use crate::storage::StorageHandle;
use crate::{AppError, Result};

use super::{poll_until, CompletionSignal, OperationClock};

/// Stamp file inside the output directory whose mtime marks the operation start.
const START_STAMP: &str = ".operation-start";

/// Artifact backend.
#[derive(Debug)]
pub struct ArtifactSignal {
    sessions_dir: PathBuf,
    artifact_name: String,
    min_bytes: u64,
    poll_interval: Duration,
    clock: OperationClock,
}

/// Size of `path` if it exists and was modified at or after `since`.
async fn fresh_len(path: &Path, since: SystemTime) -> Option<u64> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    let modified = meta.modified().ok()?;
    (meta.is_file() && modified >= since).then(|| meta.len())
}

impl ArtifactSignal {
    /// Backend with explicit settings.
    #[must_use]
    pub fn new(
        sessions_dir: PathBuf,
        artifact_name: impl Into<String>,
        min_bytes: u64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            sessions_dir,
            artifact_name: artifact_name.into(),
            min_bytes,
            poll_interval,
            clock: OperationClock::default(),
        }
    }

    /// Backend configured from `[signal]`.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::new(
            config.sessions_dir(),
            config.signal.artifact_name.clone(),
            config.signal.min_artifact_bytes,
            Duration::from_millis(config.signal.poll_interval_ms),
        )
    }

    /// Expected artifact path for a session.
    #[must_use]
    pub fn artifact_path(&self, session_id: &str) -> PathBuf {
        StorageHandle::new(&self.sessions_dir, session_id).artifact_path(&self.artifact_name)
    }

    fn error_path(&self, session_id: &str) -> PathBuf {
        StorageHandle::new(&self.sessions_dir, session_id)
            .artifact_path(&format!("{}.error", self.artifact_name))
    }
}

impl CompletionSignal for ArtifactSignal {
    fn name(&self) -> &'static str {
        "artifact"
    }

    fn begin<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let storage = StorageHandle::new(&self.sessions_dir, session_id);
            let output_dir = storage.output_dir();
            tokio::fs::create_dir_all(&output_dir).await?;
            let stamp = output_dir.join(START_STAMP);
            // A fresh inode, so the mtime is the creation time even on file
            // systems that skip the update when an empty file is truncated.
            match tokio::fs::remove_file(&stamp).await {
                Err(err) if err.kind() != std::io::ErrorKind::NotFound => return Err(err.into()),
                _ => {}
            }
            tokio::fs::write(&stamp, b"").await?;
            let started = tokio::fs::metadata(&stamp)
                .await?
                .modified()
                .unwrap_or_else(|_| SystemTime::now());
            self.clock.start_at(session_id, started);
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
            let since = self.clock.started(session_id);
            let artifact = self.artifact_path(session_id);
            let error = self.error_path(session_id);
            let min_bytes = self.min_bytes;

            let found = poll_until(timeout, self.poll_interval, || {
                let artifact = artifact.clone();
                let error = error.clone();
                async move {
                    if matches!(kind, SignalKind::Done | SignalKind::Error) {
                        if let Some(len) = fresh_len(&error, since).await {
                            return Some((SignalKind::Error, error, len));
                        }
                    }
                    if kind == SignalKind::Error {
                        return None;
                    }
                    let len = fresh_len(&artifact, since).await?;
                    match kind {
                        SignalKind::Done if len < min_bytes => None,
                        _ => Some((kind, artifact, len)),
                    }
                }
            })
            .await;

            let Some((observed, path, len)) = found else {
                return Err(AppError::SignalTimeout(format!(
                    "no fresh artifact ({}) for session {session_id} within {timeout:?}",
                    kind.as_str()
                )));
            };

            info!(session_id, kind = observed.as_str(), bytes = len, "artifact observed");
            let mut payload = json!({
                "path": path.to_string_lossy(),
                "bytes": len,
            });
            if observed == SignalKind::Error {
                let message = tokio::fs::read_to_string(&path).await.unwrap_or_default();
                payload["message"] = json!(message.trim());
            }
            Ok(Outcome::new(observed, payload))
        })
    }
}
