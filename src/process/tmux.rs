//! Detached tmux session backend driven through the tmux CLI.
//!
//! Output is mirrored to a log file with `pipe-pane`, so cursors are raw
//! byte offsets into that file and survive scrollback truncation.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ProcessConfig;
use crate::storage::StorageHandle;
use crate::{AppError, Result};

use super::{BoxFuture, OutputChunk, ProcessHandle, SESSION_ENV_VAR};

const EXIT_POLL: Duration = Duration::from_millis(200);

/// Quote a value for the `sh -c` string tmux runs for `pipe-pane`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

async fn tmux(args: &[&str]) -> Result<Output> {
    Command::new("tmux")
        .args(args)
        .output()
        .await
        .map_err(|e| AppError::Process(format!("failed to run tmux: {e}")))
}

async fn tmux_ok(args: &[&str]) -> Result<Output> {
    let output = tmux(args).await?;
    if output.status.success() {
        Ok(output)
    } else {
        Err(AppError::Process(format!(
            "tmux {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Worker hosted in a detached tmux session.
pub struct TmuxProcess {
    session_id: String,
    target: String,
    pid: Option<u32>,
    spawned_at: DateTime<Utc>,
    log_path: PathBuf,
    read_cap: u64,
    grace: Duration,
}

impl TmuxProcess {
    /// Create a detached tmux session running the host CLI.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if tmux is unavailable or any setup command fails.
    pub async fn spawn(
        config: &ProcessConfig,
        session_id: &str,
        workdir: &Path,
        storage: &StorageHandle,
    ) -> Result<Self> {
        let target = format!("overseer-{}", Uuid::new_v4().simple());
        let log_path = storage.root.join(format!("{target}.log"));
        tokio::fs::create_dir_all(&storage.root).await?;
        tokio::fs::File::create(&log_path).await?;

        let cols = config.cols.to_string();
        let rows = config.rows.to_string();
        let env = format!("{SESSION_ENV_VAR}={session_id}");
        let workdir = workdir.to_string_lossy().into_owned();

        let mut args: Vec<&str> = vec![
            "new-session",
            "-d",
            "-s",
            target.as_str(),
            "-x",
            cols.as_str(),
            "-y",
            rows.as_str(),
            "-c",
            workdir.as_str(),
            "-e",
            env.as_str(),
            "--",
            config.host_cli.as_str(),
        ];
        args.extend(config.host_cli_args.iter().map(String::as_str));
        tmux_ok(&args).await?;

        let pipe = format!("cat >> {}", shell_quote(&log_path.to_string_lossy()));
        if let Err(err) = tmux_ok(&["pipe-pane", "-o", "-t", target.as_str(), pipe.as_str()]).await {
            let _ = tmux(&["kill-session", "-t", target.as_str()]).await;
            return Err(err);
        }

        let pid = tmux_ok(&["display-message", "-p", "-t", target.as_str(), "#{pane_pid}"])
            .await
            .ok()
            .and_then(|out| String::from_utf8_lossy(&out.stdout).trim().parse().ok());

        info!(session_id, tmux_target = %target, pid, cli = %config.host_cli, "tmux worker spawned");

        Ok(Self {
            session_id: session_id.to_owned(),
            target,
            pid,
            spawned_at: Utc::now(),
            log_path,
            read_cap: config.output_buffer_bytes as u64,
            grace: Duration::from_secs(config.terminate_grace_seconds),
        })
    }

    /// Name of the tmux session.
    #[must_use]
    pub fn target(&self) -> &str {
        self.target.as_str()
    }

    async fn has_session(&self) -> bool {
        tmux(&["has-session", "-t", self.target.as_str()])
            .await
            .is_ok_and(|out| out.status.success())
    }
}

impl ProcessHandle for TmuxProcess {
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
            tmux_ok(&["send-keys", "-t", self.target.as_str(), "-l", data]).await?;
            Ok(())
        })
    }

    fn send_line<'a>(&'a self, line: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.write(line).await?;
            tmux_ok(&["send-keys", "-t", self.target.as_str(), "Enter"]).await?;
            Ok(())
        })
    }

    fn output_offset(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move { Ok(tokio::fs::metadata(&self.log_path).await?.len()) })
    }

    fn read_output(&self, since: u64) -> BoxFuture<'_, Result<OutputChunk>> {
        Box::pin(async move {
            let mut file = tokio::fs::File::open(&self.log_path).await?;
            let end = file.metadata().await?.len();
            let floor = end.saturating_sub(self.read_cap);
            let start = since.max(floor).min(end);

            file.seek(SeekFrom::Start(start)).await?;
            let mut raw = Vec::new();
            file.take(end - start).read_to_end(&mut raw).await?;

            let clean = strip_ansi_escapes::strip(&raw);
            Ok(OutputChunk {
                text: String::from_utf8_lossy(&clean).into_owned(),
                next_offset: end,
                truncated: since < floor,
            })
        })
    }

    fn resize(&self, rows: u16, cols: u16) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            tmux_ok(&[
                "resize-window",
                "-t",
                self.target.as_str(),
                "-x",
                cols.to_string().as_str(),
                "-y",
                rows.to_string().as_str(),
            ])
            .await?;
            Ok(())
        })
    }

    fn is_alive(&self) -> BoxFuture<'_, bool> {
        Box::pin(self.has_session())
    }

    fn terminate(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.has_session().await {
                return Ok(());
            }

            // Ctrl-C first; most CLIs exit or return to a prompt on interrupt.
            let _ = tmux(&["send-keys", "-t", self.target.as_str(), "C-c"]).await;
            let deadline = tokio::time::Instant::now() + self.grace;
            while tokio::time::Instant::now() < deadline {
                if !self.has_session().await {
                    debug!(session_id = %self.session_id, "tmux worker exited on interrupt");
                    return Ok(());
                }
                tokio::time::sleep(EXIT_POLL).await;
            }

            match tmux_ok(&["kill-session", "-t", self.target.as_str()]).await {
                Ok(_) => {
                    info!(session_id = %self.session_id, target = %self.target, "tmux session killed");
                    Ok(())
                }
                Err(err) if !self.has_session().await => {
                    debug!(session_id = %self.session_id, %err, "tmux session already gone");
                    Ok(())
                }
                Err(err) => {
                    warn!(session_id = %self.session_id, %err, "tmux kill-session failed");
                    Err(err)
                }
            }
        })
    }
}
