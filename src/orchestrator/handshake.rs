//! Health handshake: prove a worker is alive and accepting input.
//!
//! Each attempt writes a probe carrying a fresh nonce tag and watches the
//! output produced after that write for a line consisting of the tag alone.
//! Scanning only new output, and requiring the whole line to equal the tag,
//! keeps a stale echo from an earlier attempt (or the terminal's echo of the
//! probe command itself) from counting as success.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::models::health::HealthStatus;
use crate::process::ProcessHandle;

/// Placeholder replaced by the nonce in the probe template.
pub const TAG_PLACEHOLDER: &str = "{tag}";

const READ_POLL: Duration = Duration::from_millis(100);

/// Generate a probe tag that is unique per attempt.
#[must_use]
pub fn new_probe_tag() -> String {
    format!(
        "OVERSEER_PROBE_{}_{}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    )
}

/// Whether `output` contains a line that is exactly `tag` after trimming.
#[must_use]
pub fn probe_matches(output: &str, tag: &str) -> bool {
    output.lines().any(|line| line.trim() == tag)
}

/// Probe settings.
#[derive(Debug, Clone)]
pub struct HandshakeProber {
    max_retries: u32,
    retry_delay: Duration,
    probe_template: String,
}

impl HandshakeProber {
    /// Prober with explicit settings.
    #[must_use]
    pub fn new(max_retries: u32, retry_delay: Duration, probe_template: impl Into<String>) -> Self {
        Self {
            max_retries: max_retries.max(1),
            retry_delay,
            probe_template: probe_template.into(),
        }
    }

    /// Prober configured from `[handshake]`.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::new(
            config.handshake.max_retries,
            config.probe_retry_delay(),
            config.handshake.probe_template.clone(),
        )
    }

    /// Probe `handle` until the tag is echoed or attempts run out.
    ///
    /// Never fails: every outcome, including a dead process, is described by
    /// the returned status.
    pub async fn ensure_healthy(&self, handle: &dyn ProcessHandle) -> HealthStatus {
        let session_id = handle.session_id();
        let mut responsive = false;
        let mut last_error = String::new();

        for attempt in 1..=self.max_retries {
            if !handle.is_alive().await {
                warn!(session_id, attempt, "handshake: process not running");
                return HealthStatus {
                    process_exists: false,
                    process_responsive: false,
                    probe_succeeded: false,
                    probe_timestamp: Some(Utc::now()),
                    error: Some("process is not running".into()),
                };
            }

            let tag = new_probe_tag();
            let probe = self.probe_template.replace(TAG_PLACEHOLDER, &tag);

            let since = match handle.output_offset().await {
                Ok(offset) => offset,
                Err(err) => {
                    last_error = format!("failed to read output cursor: {err}");
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
            };

            if let Err(err) = handle.send_line(&probe).await {
                warn!(session_id, attempt, %err, "handshake: probe write failed");
                last_error = format!("probe write failed: {err}");
                tokio::time::sleep(self.retry_delay).await;
                continue;
            }
            debug!(session_id, attempt, tag, "handshake: probe sent");

            let deadline = tokio::time::Instant::now() + self.retry_delay;
            let mut read_error = None;
            loop {
                match handle.read_output(since).await {
                    Ok(chunk) => {
                        if !chunk.text.is_empty() {
                            responsive = true;
                        }
                        if probe_matches(&chunk.text, &tag) {
                            info!(session_id, attempt, "handshake: probe echoed");
                            return HealthStatus::healthy(Utc::now());
                        }
                    }
                    Err(err) => read_error = Some(format!("failed to read output: {err}")),
                }
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(READ_POLL.min(self.retry_delay)).await;
            }

            last_error = read_error.unwrap_or_else(|| {
                format!("probe tag not echoed within {:?}", self.retry_delay)
            });
            debug!(session_id, attempt, "handshake: probe not observed, retrying");
        }

        warn!(
            session_id,
            attempts = self.max_retries,
            responsive,
            "handshake: exhausted attempts"
        );
        HealthStatus {
            process_exists: true,
            process_responsive: responsive,
            probe_succeeded: false,
            probe_timestamp: Some(Utc::now()),
            error: Some(format!(
                "handshake failed after {} attempts: {last_error}",
                self.max_retries
            )),
        }
    }
}

/// Probe `handle` with the default probe template.
pub async fn ensure_healthy(
    handle: &dyn ProcessHandle,
    max_retries: u32,
    retry_delay: Duration,
) -> HealthStatus {
    HandshakeProber::new(
        max_retries,
        retry_delay,
        crate::config::HandshakeConfig::default().probe_template,
    )
    .ensure_healthy(handle)
    .await
}
