//! Pseudo-terminal backend built on `portable-pty`.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tracing::{debug, info, warn};

use crate::config::ProcessConfig;
use crate::storage::path_component;
use crate::{AppError, Result};

use super::{
    request_exit, BoxFuture, OutputBuffer, OutputChunk, ProcessHandle, ALLOWED_ENV_VARS,
    SESSION_ENV_VAR,
};

const EXIT_POLL: Duration = Duration::from_millis(100);

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Worker running inside a native pseudo-terminal.
///
/// A dedicated reader thread drains the master side into an
/// [`OutputBuffer`] until the terminal closes.
pub struct PtyProcess {
    session_id: String,
    pid: Option<u32>,
    spawned_at: DateTime<Utc>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    output: OutputBuffer,
    grace: Duration,
}

impl PtyProcess {
    /// Open a terminal and start the host CLI inside it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the terminal cannot be opened or the
    /// command cannot be started.
    pub fn spawn(config: &ProcessConfig, session_id: &str, workdir: &Path) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| AppError::Process(format!("failed to open pty: {e}")))?;

        let mut cmd = CommandBuilder::new(&config.host_cli);
        cmd.args(&config.host_cli_args);
        cmd.cwd(workdir);
        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.env(SESSION_ENV_VAR, session_id);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| AppError::Process(format!("failed to spawn {}: {e}", config.host_cli)))?;
        // The slave end must close in this process for EOF to reach the reader.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| AppError::Process(format!("failed to clone pty reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| AppError::Process(format!("failed to take pty writer: {e}")))?;

        let output = OutputBuffer::new(config.output_buffer_bytes);
        spawn_reader(session_id, reader, output.clone())?;

        let pid = child.process_id();
        info!(session_id, pid, cli = %config.host_cli, "pty worker spawned");

        Ok(Self {
            session_id: session_id.to_owned(),
            pid,
            spawned_at: Utc::now(),
            master: Mutex::new(pair.master),
            writer: Arc::new(Mutex::new(writer)),
            child: Mutex::new(child),
            output,
            grace: Duration::from_secs(config.terminate_grace_seconds),
        })
    }

    fn exited(&self) -> bool {
        !matches!(lock(&self.child).try_wait(), Ok(None))
    }
}

fn spawn_reader(
    session_id: &str,
    mut reader: Box<dyn Read + Send>,
    output: OutputBuffer,
) -> Result<()> {
    let sid = session_id.to_owned();
    std::thread::Builder::new()
        .name(format!("pty-reader-{}", path_component(&sid)))
        .spawn(move || {
            let mut buf = [0_u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => output.push_bytes(&buf[..n]),
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        debug!(session_id = %sid, %err, "pty reader stopped");
                        break;
                    }
                }
            }
        })
        .map(|_| ())
        .map_err(|e| AppError::Process(format!("failed to start pty reader: {e}")))
}

impl ProcessHandle for PtyProcess {
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
        let writer = Arc::clone(&self.writer);
        let bytes = data.as_bytes().to_vec();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let mut guard = lock(writer.as_ref());
                guard.write_all(&bytes)?;
                guard.flush()
            })
            .await
            .map_err(|e| AppError::Process(format!("pty write task failed: {e}")))?
            .map_err(|e| AppError::Process(format!("pty write failed: {e}")))
        })
    }

    fn send_line<'a>(&'a self, line: &'a str) -> BoxFuture<'a, Result<()>> {
        // Terminals submit on carriage return.
        Box::pin(async move { self.write(&format!("{line}\r")).await })
    }

    fn output_offset(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { Ok(self.output.end_offset()) })
    }

    fn read_output(&self, since: u64) -> BoxFuture<'_, Result<OutputChunk>> {
        Box::pin(async move { Ok(self.output.read_since(since)) })
    }

    fn resize(&self, rows: u16, cols: u16) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            lock(&self.master)
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(|e| AppError::Process(format!("pty resize failed: {e}")))
        })
    }

    fn is_alive(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { !self.exited() })
    }

    fn terminate(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.exited() {
                return Ok(());
            }

            if self.pid.is_some_and(request_exit) {
                let deadline = tokio::time::Instant::now() + self.grace;
                while tokio::time::Instant::now() < deadline {
                    if self.exited() {
                        info!(session_id = %self.session_id, "pty worker exited gracefully");
                        return Ok(());
                    }
                    tokio::time::sleep(EXIT_POLL).await;
                }
                warn!(session_id = %self.session_id, "pty worker ignored SIGTERM, killing");
            }

            lock(&self.child)
                .kill()
                .map_err(|e| AppError::Process(format!("failed to kill pty worker: {e}")))?;
            info!(session_id = %self.session_id, "pty worker killed");
            Ok(())
        })
    }
}
