#![forbid(unsafe_code)]

//! `agent-overseer`: supervisor server binary.
//!
//! Bootstraps configuration and storage, recovers from a prior crash, then
//! runs the push/subscribe HTTP server, the IPC server for
//! `agent-overseer-ctl`, the queue monitor, the child monitor, and the
//! retention task until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_overseer::broadcast::journal::EventJournal;
use agent_overseer::collaborators::Collaborators;
use agent_overseer::config::GlobalConfig;
use agent_overseer::orchestrator::child_monitor;
use agent_overseer::models::work_item::{WorkFailure, REASON_INTERRUPTED};
use agent_overseer::persistence::retention::{self, RetentionFiles};
use agent_overseer::persistence::db;
use agent_overseer::persistence::work_item_repo::WorkItemRepo;
use agent_overseer::process::NativeSpawner;
use agent_overseer::state::{AppState, StateParts};
use agent_overseer::{ipc, server, AppError, Result};

/// File inside the data directory holding the IPC token for the ctl binary.
const TOKEN_FILE: &str = "ipc.token";

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-overseer", about = "Terminal agent supervisor", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the configured data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-overseer bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    tokio::fs::create_dir_all(&config.data_dir).await?;
    let config = Arc::new(config);
    info!(data_dir = %config.data_dir.display(), "configuration loaded");

    // ── Initialize database ─────────────────────────────
    let db = Arc::new(db::connect(&config.db_path()).await?);
    info!("database connected");

    // ── Build shared application state ──────────────────
    let ct = CancellationToken::new();
    let ipc_auth_token = uuid::Uuid::new_v4().to_string();
    write_token_file(&config, &ipc_auth_token).await?;

    let state = AppState::build(StateParts {
        config: Arc::clone(&config),
        db: Arc::clone(&db),
        spawner: Arc::new(NativeSpawner::new(config.process.clone())),
        collaborators: Collaborators::unconfigured(config.templates_dir()),
        ipc_auth_token: Some(ipc_auth_token),
        shutdown: ct.clone(),
    })?;

    // ── Recover from a prior crash ──────────────────────
    recover_on_startup(&state).await;

    // ── Start background services ───────────────────────
    let files = RetentionFiles {
        sessions_dir: config.sessions_dir(),
        journal: EventJournal::new(config.journal_dir()).ok(),
    };
    let retention_handle =
        retention::spawn_retention_task(Arc::clone(&db), config.retention_days, files, ct.clone());
    info!("retention service started");

    let child_handle = child_monitor::spawn_child_monitor(
        Arc::clone(&state.sessions),
        child_monitor::POLL_INTERVAL,
        ct.clone(),
    );

    let http_ct = ct.clone();
    let http_state = Arc::clone(&state);
    let http_handle = tokio::spawn(async move {
        if let Err(err) = server::serve_http(http_state, http_ct).await {
            error!(%err, "http server failed");
        }
    });

    let ipc_handle = ipc::server::spawn_ipc_server(Arc::clone(&state), ct.clone())?;

    if config.queue.autostart {
        state.monitor.start().await;
    }

    info!("agent-overseer ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    state.monitor.stop().await;
    state.sessions.shutdown_all().await;

    // ── Wait for background tasks ───────────────────────
    let _ = tokio::join!(retention_handle, child_handle, http_handle, ipc_handle);
    if let Err(err) = tokio::fs::remove_file(config.data_dir.join(TOKEN_FILE)).await {
        warn!(%err, "failed to remove ipc token file");
    }
    info!("agent-overseer shut down");

    Ok(())
}

/// Fail work items and sessions that were live when the previous server
/// instance stopped without a graceful shutdown.
async fn recover_on_startup(state: &AppState) {
    match WorkItemRepo::new(Arc::clone(&state.db))
        .fail_all_running(&WorkFailure::new(
            "server stopped while the item was running",
            REASON_INTERRUPTED,
        ))
        .await
    {
        Ok(0) => {}
        Ok(count) => warn!(count, "failed work items interrupted by a prior crash"),
        Err(err) => error!(%err, "failed to recover running work items"),
    }

    match state.sessions.recover_on_startup().await {
        Ok(0) => info!("no interrupted sessions found on startup"),
        Ok(count) => warn!(count, "moved stranded sessions to error"),
        Err(err) => error!(%err, "failed to recover sessions"),
    }
}

/// Publish the IPC token so `agent-overseer-ctl --data-dir` can authenticate.
async fn write_token_file(config: &GlobalConfig, token: &str) -> Result<()> {
    let path = config.data_dir.join(TOKEN_FILE);
    tokio::fs::write(&path, token).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
