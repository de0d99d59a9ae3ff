//! Plain child process with piped stdio.
//!
//! Used where no terminal is needed or available. The child gets a scrubbed
//! environment and is killed if the handle is dropped.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ProcessConfig;
use crate::{AppError, Result};

use super::{
    request_exit, BoxFuture, OutputBuffer, OutputChunk, ProcessHandle, ALLOWED_ENV_VARS,
    SESSION_ENV_VAR,
};

/// Worker connected through stdin/stdout/stderr pipes.
pub struct PipedProcess {
    session_id: String,
    pid: Option<u32>,
    spawned_at: DateTime<Utc>,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Child>,
    output: OutputBuffer,
    grace: Duration,
}

impl PipedProcess {
    /// Start the host CLI with piped stdio.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the process cannot be started or its
    /// pipes cannot be captured.
    pub fn spawn(config: &ProcessConfig, session_id: &str, workdir: &Path) -> Result<Self> {
        let mut cmd = Command::new(&config.host_cli);
        cmd.args(&config.host_cli_args);

        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.env(SESSION_ENV_VAR, session_id);

        cmd.current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Process(format!("failed to spawn {}: {err}", config.host_cli)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Process("failed to capture worker stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Process("failed to capture worker stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Process("failed to capture worker stderr".into()))?;

        let output = OutputBuffer::new(config.output_buffer_bytes);
        tokio::spawn(drain(session_id.to_owned(), stdout, output.clone()));
        tokio::spawn(drain(session_id.to_owned(), stderr, output.clone()));

        let pid = child.id();
        info!(session_id, pid, cli = %config.host_cli, "piped worker spawned");

        Ok(Self {
            session_id: session_id.to_owned(),
            pid,
            spawned_at: Utc::now(),
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(child),
            output,
            grace: Duration::from_secs(config.terminate_grace_seconds),
        })
    }
}

async fn drain(session_id: String, mut stream: impl AsyncRead + Unpin, output: OutputBuffer) {
    let mut buf = vec![0_u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => output.push_bytes(&buf[..n]),
            Err(err) => {
                debug!(session_id, %err, "worker stream closed");
                break;
            }
        }
    }
}

impl ProcessHandle for PipedProcess {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn spawned_at(&self) -> DateTime<Utc> {
        self.spawned_at
    }

    fn write<'a>(&'a self, data: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut guard = self.stdin.lock().await;
            let stdin = guard
                .as_mut()
                .ok_or_else(|| AppError::Process("worker stdin is closed".into()))?;
            stdin
                .write_all(data.as_bytes())
                .await
                .map_err(|e| AppError::Process(format!("worker write failed: {e}")))?;
            stdin
                .flush()
                .await
                .map_err(|e| AppError::Process(format!("worker flush failed: {e}")))
        })
    }

    fn output_offset(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { Ok(self.output.end_offset()) })
    }

    fn read_output(&self, since: u64) -> BoxFuture<'_, Result<OutputChunk>> {
        Box::pin(async move { Ok(self.output.read_since(since)) })
    }

    fn resize(&self, rows: u16, cols: u16) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            debug!(session_id = %self.session_id, rows, cols, "resize ignored for piped worker");
            Ok(())
        })
    }

    fn is_alive(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { matches!(self.child.lock().await.try_wait(), Ok(None)) })
    }

    fn terminate(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            // Closing stdin is the first hint for CLIs that exit on EOF.
            self.stdin.lock().await.take();

            let mut child = self.child.lock().await;
            if !matches!(child.try_wait(), Ok(None)) {
                return Ok(());
            }

            if self.pid.is_some_and(request_exit) {
                if let Ok(status) = tokio::time::timeout(self.grace, child.wait()).await {
                    info!(session_id = %self.session_id, ?status, "piped worker exited gracefully");
                    return Ok(());
                }
                warn!(session_id = %self.session_id, "piped worker ignored SIGTERM, killing");
            }

            child
                .kill()
                .await
                .map_err(|e| AppError::Process(format!("failed to kill worker: {e}")))?;
            info!(session_id = %self.session_id, "piped worker killed");
            Ok(())
        })
    }
}
