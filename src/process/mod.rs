//! Worker process handles.
//!
//! A [`ProcessHandle`] wraps one spawned worker (pseudo-terminal, piped
//! stdio, or tmux session) and belongs to exactly one session. Output is
//! read through opaque cursors so a caller can look only at what arrived
//! after a given point.

pub mod output;
pub mod piped;
pub mod pty;
pub mod tmux;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::{ProcessBackend, ProcessConfig};
use crate::storage::StorageHandle;
use crate::Result;

pub use self::output::{OutputBuffer, OutputChunk};

/// Boxed future used by the object-safe process traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Environment variables inherited by spawned workers.
///
/// Everything else is stripped with `env_clear()` so server secrets never
/// reach the worker.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "TERM",
    "RUST_LOG",
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Variable carrying the session id into the worker environment.
pub const SESSION_ENV_VAR: &str = "OVERSEER_SESSION_ID";

/// Live worker process.
pub trait ProcessHandle: Send + Sync {
    /// Session that owns this process.
    fn session_id(&self) -> &str;

    /// OS process id, when known.
    fn pid(&self) -> Option<u32>;

    /// When the process was spawned.
    fn spawned_at(&self) -> DateTime<Utc>;

    /// Write raw input.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the input cannot be delivered.
    fn write<'a>(&'a self, data: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Write one line of input followed by the backend's line terminator.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the input cannot be delivered.
    fn send_line<'a>(&'a self, line: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.write(&format!("{line}\n")).await })
    }

    /// Cursor positioned after the newest output.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` or `AppError::Io` if the output source is unreadable.
    fn output_offset(&self) -> BoxFuture<'_, Result<u64>>;

    /// Output produced after `since`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` or `AppError::Io` if the output source is unreadable.
    fn read_output(&self, since: u64) -> BoxFuture<'_, Result<OutputChunk>>;

    /// Change the terminal size. A no-op for backends without a terminal.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the resize request fails.
    fn resize(&self, rows: u16, cols: u16) -> BoxFuture<'_, Result<()>>;

    /// Whether the process is still running.
    fn is_alive(&self) -> BoxFuture<'_, bool>;

    /// Stop the process: polite request first, forced kill after the grace period.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the process cannot be stopped.
    fn terminate(&self) -> BoxFuture<'_, Result<()>>;
}

/// Builds process handles for sessions.
pub trait ProcessSpawner: Send + Sync {
    /// Spawn a worker for `session_id` using `storage` for its working files.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the worker cannot be started.
    fn spawn<'a>(
        &'a self,
        session_id: &'a str,
        storage: &'a StorageHandle,
    ) -> BoxFuture<'a, Result<Arc<dyn ProcessHandle>>>;
}

/// Spawner selecting the backend from [`ProcessConfig`].
pub struct NativeSpawner {
    config: ProcessConfig,
}

impl NativeSpawner {
    /// Create a spawner for the configured backend.
    #[must_use]
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }
}

impl ProcessSpawner for NativeSpawner {
    fn spawn<'a>(
        &'a self,
        session_id: &'a str,
        storage: &'a StorageHandle,
    ) -> BoxFuture<'a, Result<Arc<dyn ProcessHandle>>> {
        Box::pin(async move {
            let workdir = self
                .config
                .workspace_root
                .clone()
                .unwrap_or_else(|| storage.root.clone());

            let handle: Arc<dyn ProcessHandle> = match self.config.backend {
                ProcessBackend::Pty => {
                    Arc::new(pty::PtyProcess::spawn(&self.config, session_id, &workdir)?)
                }
                ProcessBackend::Piped => {
                    Arc::new(piped::PipedProcess::spawn(&self.config, session_id, &workdir)?)
                }
                ProcessBackend::Tmux => Arc::new(
                    tmux::TmuxProcess::spawn(&self.config, session_id, &workdir, storage).await?,
                ),
            };
            Ok(handle)
        })
    }
}

/// Ask a process to exit with `SIGTERM`. Returns whether the signal was sent.
#[cfg(unix)]
pub(crate) fn request_exit(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    i32::try_from(pid).is_ok_and(|raw| kill(Pid::from_raw(raw), Signal::SIGTERM).is_ok())
}

/// No polite exit request exists on this platform; callers fall through to a kill.
#[cfg(not(unix))]
pub(crate) fn request_exit(_pid: u32) -> bool {
    false
}
