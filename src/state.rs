//! Shared application state.
//!
//! Built once at startup and handed to every component by `Arc`; there are
//! no process-wide globals.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::broadcast::journal::EventJournal;
use crate::broadcast::BroadcastHub;
use crate::collaborators::Collaborators;
use crate::config::GlobalConfig;
use crate::orchestrator::pipeline::PipelineOrchestrator;
use crate::orchestrator::queue_monitor::{MonitorController, PipelineDispatcher, QueueMonitor};
use crate::orchestrator::session_manager::SessionManager;
use crate::persistence::db::Database;
use crate::process::ProcessSpawner;
use crate::registry::SessionRegistry;
use crate::signal::{self, CompletionSignal};
use crate::Result;

/// Shared application state accessible to the HTTP server, IPC server, and tasks.
pub struct AppState {
    /// Global configuration.
    pub config: Arc<GlobalConfig>,
    /// `SQLite` connection pool.
    pub db: Arc<Database>,
    /// Per-session observer fan-out.
    pub hub: Arc<BroadcastHub>,
    /// Transient per-session signal state.
    pub registry: Arc<SessionRegistry>,
    /// Configured completion detection backend.
    pub signals: Arc<dyn CompletionSignal>,
    /// Session lifecycle and worker handles.
    pub sessions: Arc<SessionManager>,
    /// Step runner.
    pub orchestrator: Arc<PipelineOrchestrator>,
    /// Queue monitor switch.
    pub monitor: Arc<MonitorController>,
    /// Shared secret required on IPC commands, when set.
    pub ipc_auth_token: Option<String>,
    /// Server-wide shutdown token.
    pub shutdown: CancellationToken,
}

/// Inputs that differ between the binary and tests.
pub struct StateParts {
    /// Global configuration.
    pub config: Arc<GlobalConfig>,
    /// Connected database.
    pub db: Arc<Database>,
    /// Worker factory.
    pub spawner: Arc<dyn ProcessSpawner>,
    /// External services.
    pub collaborators: Collaborators,
    /// IPC shared secret.
    pub ipc_auth_token: Option<String>,
    /// Server-wide shutdown token.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire every component together.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the broadcast journal directory cannot be
    /// created.
    pub fn build(parts: StateParts) -> Result<Arc<Self>> {
        let StateParts {
            config,
            db,
            spawner,
            collaborators,
            ipc_auth_token,
            shutdown,
        } = parts;

        let journal = if config.broadcast.persist_history {
            Some(EventJournal::new(config.journal_dir())?)
        } else {
            None
        };
        let hub = Arc::new(BroadcastHub::new(config.broadcast.clone(), journal));
        let registry = Arc::new(SessionRegistry::new());
        let signals = signal::from_config(&config, Arc::clone(&registry));

        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&db),
            Arc::clone(&config),
            Arc::clone(&hub),
            Arc::clone(&registry),
            spawner,
        ));
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            Arc::clone(&db),
            Arc::clone(&sessions),
            Arc::clone(&hub),
            Arc::clone(&signals),
            Arc::new(collaborators),
            Arc::clone(&config),
        ));
        let dispatcher = Arc::new(PipelineDispatcher::new(
            Arc::clone(&db),
            Arc::clone(&orchestrator),
            Arc::clone(&hub),
        ));
        let queue = Arc::new(QueueMonitor::new(
            Arc::clone(&db),
            &config,
            dispatcher,
            Arc::clone(&hub),
        ));
        let monitor = Arc::new(MonitorController::new(queue, shutdown.clone()));

        Ok(Arc::new(Self {
            config,
            db,
            hub,
            registry,
            signals,
            sessions,
            orchestrator,
            monitor,
            ipc_auth_token,
            shutdown,
        }))
    }
}
