//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Which terminal substrate hosts the worker process.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessBackend {
    /// Native pseudo-terminal via `portable-pty`.
    #[default]
    Pty,
    /// Plain child process with piped stdio.
    Piped,
    /// Detached tmux session driven through the tmux CLI.
    Tmux,
}

/// Which completion-detection strategy the orchestrator waits on.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignalBackend {
    /// Sentinel file existence.
    Marker,
    /// Output file existence + freshness + minimum size.
    Artifact,
    /// Explicit push notification through the `/signal` endpoint.
    #[default]
    ToolCall,
}

/// Worker process launch settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ProcessConfig {
    /// Terminal substrate.
    pub backend: ProcessBackend,
    /// Host CLI binary (e.g., `claude`).
    pub host_cli: String,
    /// Default arguments for the host CLI.
    pub host_cli_args: Vec<String>,
    /// Working directory for spawned workers; defaults to the session directory.
    pub workspace_root: Option<PathBuf>,
    /// Initial terminal rows.
    pub rows: u16,
    /// Initial terminal columns.
    pub cols: u16,
    /// Bytes of recent output retained per process for probe matching.
    pub output_buffer_bytes: usize,
    /// Seconds to wait for a graceful exit before force-killing.
    pub terminate_grace_seconds: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            backend: ProcessBackend::default(),
            host_cli: "claude".into(),
            host_cli_args: Vec::new(),
            workspace_root: None,
            rows: 24,
            cols: 120,
            output_buffer_bytes: 256 * 1024,
            terminate_grace_seconds: 5,
        }
    }
}

/// Handshake probe settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct HandshakeConfig {
    /// Probe attempts before the process is declared unhealthy.
    pub max_retries: u32,
    /// Delay between probe attempts.
    pub retry_delay_ms: u64,
    /// Input template written to the worker; `{tag}` is replaced by the nonce.
    pub probe_template: String,
    /// Maximum age of a reusable process handle.
    pub max_age_days: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            probe_template: "echo {tag}".into(),
            max_age_days: 5,
        }
    }
}

/// Completion signal settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct SignalConfig {
    /// Detection strategy.
    pub backend: SignalBackend,
    /// Poll interval for file-based backends.
    pub poll_interval_ms: u64,
    /// Delay after a marker appears before reporting it.
    ///
    /// A race mitigation for workers that create the marker before their
    /// trailing output is flushed. It is a heuristic, not a guarantee.
    pub settle_delay_ms: u64,
    /// Smallest artifact accepted as complete.
    pub min_artifact_bytes: u64,
    /// File name of the expected output artifact inside the session output dir.
    pub artifact_name: String,
    /// Default timeout for acknowledgement waits.
    pub ack_timeout_seconds: u64,
    /// Default timeout for completion waits.
    pub done_timeout_seconds: u64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            backend: SignalBackend::default(),
            poll_interval_ms: 500,
            settle_delay_ms: 2000,
            min_artifact_bytes: 1,
            artifact_name: "result.md".into(),
            ack_timeout_seconds: 120,
            done_timeout_seconds: 1800,
        }
    }
}

/// Job queue and stale-work monitor settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct QueueConfig {
    /// Maximum running items per session.
    pub concurrency_limit: u32,
    /// Dispatch poll interval.
    pub poll_interval_seconds: u64,
    /// Stale scan interval (slower cadence than dispatch).
    pub stale_scan_interval_seconds: u64,
    /// Running time after which an item is considered abandoned.
    pub stale_timeout_seconds: u64,
    /// Whether the monitor starts with the server.
    pub autostart: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 1,
            poll_interval_seconds: 5,
            stale_scan_interval_seconds: 60,
            stale_timeout_seconds: 1800,
            autostart: true,
        }
    }
}

/// Broadcast hub settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct BroadcastConfig {
    /// Maximum events retained per session.
    pub history_limit: usize,
    /// Maximum serialized bytes retained per session; 0 disables the byte cap.
    pub history_max_bytes: usize,
    /// Whether events are appended to a per-session journal on disk.
    pub persist_history: bool,
    /// Per-observer channel capacity before the observer is considered dead.
    pub observer_buffer: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            history_limit: 1000,
            history_max_bytes: 0,
            persist_history: true,
            observer_buffer: 256,
        }
    }
}

/// Upper clamp for day-valued settings so chrono conversions never overflow.
const MAX_DAYS: u64 = 36_500;

fn default_retention_days() -> u32 {
    30
}

fn default_http_port() -> u16 {
    3000
}

fn default_ipc_name() -> String {
    "agent-overseer".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Root directory for the database, per-session directories, and journals.
    pub data_dir: PathBuf,
    /// HTTP port for the push/subscribe server.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Named pipe / Unix socket identifier for operator commands.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Days after termination before session data is purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Worker process settings.
    #[serde(default)]
    pub process: ProcessConfig,
    /// Handshake probe settings.
    #[serde(default)]
    pub handshake: HandshakeConfig,
    /// Completion signal settings.
    #[serde(default)]
    pub signal: SignalConfig,
    /// Job queue settings.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Broadcast hub settings.
    #[serde(default)]
    pub broadcast: BroadcastConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Path of the `SQLite` database file.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("overseer.db")
    }

    /// Directory holding one sub-directory per session.
    #[must_use]
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Directory holding per-session broadcast journals.
    #[must_use]
    pub fn journal_dir(&self) -> PathBuf {
        self.data_dir.join("journal")
    }

    /// Directory searched for prompt templates (`<template_id>.md`).
    #[must_use]
    pub fn templates_dir(&self) -> PathBuf {
        self.data_dir.join("templates")
    }

    /// Delay between handshake probe attempts.
    #[must_use]
    pub fn probe_retry_delay(&self) -> Duration {
        Duration::from_millis(self.handshake.retry_delay_ms)
    }

    /// Maximum age of a reusable process handle.
    #[must_use]
    pub fn max_process_age(&self) -> chrono::Duration {
        let days = self.handshake.max_age_days.min(MAX_DAYS);
        chrono::Duration::days(i64::try_from(days).unwrap_or(0))
    }

    /// Default acknowledgement timeout.
    #[must_use]
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.signal.ack_timeout_seconds)
    }

    /// Default completion timeout.
    #[must_use]
    pub fn done_timeout(&self) -> Duration {
        Duration::from_secs(self.signal.done_timeout_seconds)
    }

    /// Running time after which a work item is reclaimed.
    #[must_use]
    pub fn stale_timeout(&self) -> chrono::Duration {
        let secs = self.queue.stale_timeout_seconds.min(MAX_DAYS * 86_400);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(0))
    }

    fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(AppError::Config("data_dir must not be empty".into()));
        }

        if self.process.host_cli.trim().is_empty() {
            return Err(AppError::Config("process.host_cli must not be empty".into()));
        }

        if self.queue.concurrency_limit == 0 {
            return Err(AppError::Config(
                "queue.concurrency_limit must be greater than zero".into(),
            ));
        }

        if self.queue.poll_interval_seconds == 0 || self.queue.stale_scan_interval_seconds == 0 {
            return Err(AppError::Config(
                "queue poll intervals must be greater than zero".into(),
            ));
        }

        if self.handshake.max_retries == 0 {
            return Err(AppError::Config(
                "handshake.max_retries must be greater than zero".into(),
            ));
        }

        if !self.handshake.probe_template.contains("{tag}") {
            return Err(AppError::Config(
                "handshake.probe_template must contain {tag}".into(),
            ));
        }

        if self.broadcast.history_limit == 0 {
            return Err(AppError::Config(
                "broadcast.history_limit must be greater than zero".into(),
            ));
        }

        if self.broadcast.observer_buffer == 0 {
            return Err(AppError::Config(
                "broadcast.observer_buffer must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
