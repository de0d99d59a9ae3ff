//! Session lifecycle: durable records, worker handles, and health.
//!
//! The manager owns the only map from session id to live
//! [`ProcessHandle`], so a handle always belongs to exactly one session.
//! Operations that spawn or stop a worker take a per-session lock and run
//! one at a time for that session; different sessions proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tracing::{info, info_span, warn, Instrument};

use crate::broadcast::BroadcastHub;
use crate::config::GlobalConfig;
use crate::models::event::{BroadcastEvent, EventType};
use crate::models::health::{HealthPatch, HealthStatus};
use crate::models::session::{Session, SessionState};
use crate::orchestrator::handshake::HandshakeProber;
use crate::persistence::db::Database;
use crate::persistence::session_repo::{state_str, SessionRepo};
use crate::process::{ProcessHandle, ProcessSpawner};
use crate::registry::SessionRegistry;
use crate::storage::StorageHandle;
use crate::{AppError, Result};

/// Reason recorded when the server restarts with sessions mid-flight.
pub const REASON_PROCESS_LOST: &str = "process_lost";

/// Reason recorded when a ready session's worker is replaced.
pub const REASON_RESPAWN: &str = "respawn";

type HandleMap = HashMap<String, Arc<dyn ProcessHandle>>;

/// Owner of session records and their worker processes.
pub struct SessionManager {
    repo: SessionRepo,
    config: Arc<GlobalConfig>,
    hub: Arc<BroadcastHub>,
    registry: Arc<SessionRegistry>,
    spawner: Arc<dyn ProcessSpawner>,
    prober: HandshakeProber,
    handles: Mutex<HandleMap>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionManager {
    /// Build a manager over shared collaborators.
    #[must_use]
    pub fn new(
        db: Arc<Database>,
        config: Arc<GlobalConfig>,
        hub: Arc<BroadcastHub>,
        registry: Arc<SessionRegistry>,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Self {
        let prober = HandshakeProber::from_config(&config);
        Self {
            repo: SessionRepo::new(db),
            config,
            hub,
            registry,
            spawner,
            prober,
            handles: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the prober, e.g. with shorter retry delays.
    #[must_use]
    pub fn with_prober(mut self, prober: HandshakeProber) -> Self {
        self.prober = prober;
        self
    }

    fn handles(&self) -> MutexGuard<'_, HandleMap> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(session_id.to_owned()).or_default())
    }

    /// Storage layout for a session. Nothing is created on disk.
    #[must_use]
    pub fn storage(&self, session_id: &str) -> StorageHandle {
        StorageHandle::new(&self.config.sessions_dir(), session_id)
    }

    /// Create the session's directories and record.
    ///
    /// Idempotent: an existing record keeps its state and data, and existing
    /// files are left alone. A new record starts in `created`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directories cannot be created or
    /// `AppError::Db` if the record cannot be written.
    pub async fn initialize_structure(&self, session_id: &str) -> Result<StorageHandle> {
        let storage = self.storage(session_id);
        storage.create_dirs().await?;
        let (session, created) = self.repo.ensure(session_id).await?;
        self.registry.register(session_id);

        if created {
            info!(session_id, "session structure initialized");
            self.announce_state(&session);
        }
        Ok(storage)
    }

    /// Stored session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.repo.get_by_id(session_id).await
    }

    /// Every stored session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.repo.list().await
    }

    /// Last-known health. Never touches the worker.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn get_health(&self, session_id: &str) -> Result<HealthStatus> {
        Ok(self.repo.get_by_id(session_id).await?.health)
    }

    /// Merge a partial health update.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn update_health(&self, session_id: &str, patch: &HealthPatch) -> Result<HealthStatus> {
        Ok(self.repo.patch_health(session_id, patch).await?.health)
    }

    /// Apply a lifecycle transition and tell observers.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the state machine forbids it.
    pub async fn transition(&self, session_id: &str, next: SessionState) -> Result<Session> {
        let session = self.repo.update_state(session_id, next).await?;
        self.announce_state(&session);
        Ok(session)
    }

    /// Move the session to `error` and emit an `error` event carrying the
    /// same message and reason that were persisted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` for terminated sessions.
    pub async fn record_error(&self, session_id: &str, message: &str, reason: &str) -> Result<Session> {
        let session = self.repo.record_error(session_id, message, reason).await?;
        warn!(session_id, reason, error = message, "session entered error state");
        self.hub.broadcast(
            BroadcastEvent::new(session_id, EventType::Error)
                .with("message", message)
                .with("reason", reason)
                .with("error_count", session.error_count),
        );
        self.announce_state(&session);
        Ok(session)
    }

    /// Live handle for a session, if one is attached.
    #[must_use]
    pub fn handle(&self, session_id: &str) -> Option<Arc<dyn ProcessHandle>> {
        self.handles().get(session_id).cloned()
    }

    /// All attached handles.
    #[must_use]
    pub fn live_handles(&self) -> Vec<(String, Arc<dyn ProcessHandle>)> {
        self.handles()
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect()
    }

    /// Detach a handle without stopping it. Returns whether one was attached.
    pub fn detach(&self, session_id: &str) -> bool {
        self.handles().remove(session_id).is_some()
    }

    /// Detach `handle` only if it is still the one attached to the session.
    pub fn detach_if_current(&self, session_id: &str, handle: &Arc<dyn ProcessHandle>) -> bool {
        let mut handles = self.handles();
        let current = handles
            .get(session_id)
            .is_some_and(|attached| same_handle(attached, handle));
        if current {
            handles.remove(session_id);
        }
        current
    }

    /// Return a healthy worker for the session, spawning one if needed.
    ///
    /// An attached handle is reused only when it is younger than the
    /// configured maximum age and passes a fresh handshake. Anything else is
    /// terminated and replaced, and the replacement is probed before it is
    /// handed out. On success the session is `ready`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Handshake` if the new worker never answers its
    /// probe, `AppError::Process` if it cannot be spawned. Both leave the
    /// session in `error` with the detail recorded.
    pub async fn create_session(&self, session_id: &str) -> Result<Arc<dyn ProcessHandle>> {
        let span = info_span!("create_session", session_id);
        async {
            let lock = self.session_lock(session_id);
            let _guard = lock.lock().await;

            let storage = self.initialize_structure(session_id).await?;

            if let Some(existing) = self.handle(session_id) {
                if let Some(handle) = self.try_reuse(session_id, existing).await? {
                    return Ok(handle);
                }
            }

            self.spawn_fresh(session_id, &storage).await
        }
        .instrument(span)
        .await
    }

    async fn try_reuse(
        &self,
        session_id: &str,
        existing: Arc<dyn ProcessHandle>,
    ) -> Result<Option<Arc<dyn ProcessHandle>>> {
        let age = Utc::now() - existing.spawned_at();
        if age < self.config.max_process_age() {
            let health = self.prober.ensure_healthy(existing.as_ref()).await;
            self.repo.set_health(session_id, &health).await?;
            if health.is_healthy() {
                self.ensure_ready(session_id).await?;
                info!(session_id, "reusing healthy worker");
                return Ok(Some(existing));
            }
            warn!(
                session_id,
                error = health.error.as_deref().unwrap_or("unknown"),
                "attached worker failed its handshake; respawning"
            );
        } else {
            info!(session_id, age_hours = age.num_hours(), "worker exceeded max age; respawning");
        }

        self.detach(session_id);
        if let Err(err) = existing.terminate().await {
            warn!(session_id, %err, "failed to terminate replaced worker");
        }
        Ok(None)
    }

    async fn spawn_fresh(
        &self,
        session_id: &str,
        storage: &StorageHandle,
    ) -> Result<Arc<dyn ProcessHandle>> {
        self.enter_initializing(session_id).await?;

        let handle = match self.spawner.spawn(session_id, storage).await {
            Ok(handle) => handle,
            Err(err) => {
                self.record_error(session_id, &err.to_string(), err.reason())
                    .await?;
                return Err(err);
            }
        };
        info!(session_id, pid = ?handle.pid(), "worker spawned");

        let health = self.prober.ensure_healthy(handle.as_ref()).await;
        self.repo.set_health(session_id, &health).await?;

        if health.is_healthy() {
            self.handles()
                .insert(session_id.to_owned(), Arc::clone(&handle));
            self.transition(session_id, SessionState::Ready).await?;
            return Ok(handle);
        }

        if let Err(err) = handle.terminate().await {
            warn!(session_id, %err, "failed to terminate unresponsive worker");
        }
        let message = health
            .error
            .unwrap_or_else(|| "worker did not answer the handshake probe".into());
        let err = AppError::Handshake(message);
        self.record_error(session_id, &err.to_string(), err.reason())
            .await?;
        Err(err)
    }

    /// Walk the state machine to `initializing` from wherever the session is.
    async fn enter_initializing(&self, session_id: &str) -> Result<()> {
        let session = self.repo.get_by_id(session_id).await?;
        match session.state {
            SessionState::Initializing => Ok(()),
            SessionState::Processing => {
                self.record_error(session_id, "worker replaced mid-task", REASON_PROCESS_LOST)
                    .await?;
                self.transition(session_id, SessionState::Initializing)
                    .await
                    .map(drop)
            }
            // Ready never re-enters initializing directly.
            SessionState::Ready => {
                self.record_error(session_id, "worker respawned", REASON_RESPAWN)
                    .await?;
                self.transition(session_id, SessionState::Initializing)
                    .await
                    .map(drop)
            }
            _ => self
                .transition(session_id, SessionState::Initializing)
                .await
                .map(drop),
        }
    }

    async fn ensure_ready(&self, session_id: &str) -> Result<()> {
        let session = self.repo.get_by_id(session_id).await?;
        match session.state {
            SessionState::Ready | SessionState::Processing => Ok(()),
            SessionState::Initializing => self
                .transition(session_id, SessionState::Ready)
                .await
                .map(drop),
            _ => {
                self.transition(session_id, SessionState::Initializing)
                    .await?;
                self.transition(session_id, SessionState::Ready)
                    .await
                    .map(drop)
            }
        }
    }

    /// Stop the worker and mark the session terminated.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist or
    /// `AppError::InvalidTransition` if it is already terminated.
    pub async fn terminate_session(&self, session_id: &str) -> Result<Session> {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let handle = self.handles().remove(session_id);
        if let Some(handle) = handle {
            if let Err(err) = handle.terminate().await {
                warn!(session_id, %err, "worker did not stop cleanly");
            }
        }

        self.repo
            .patch_health(
                session_id,
                &HealthPatch {
                    process_exists: Some(false),
                    process_responsive: Some(false),
                    ..HealthPatch::default()
                },
            )
            .await?;
        let session = self.transition(session_id, SessionState::Terminated).await?;
        self.registry.remove(session_id);
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        info!(session_id, "session terminated");
        Ok(session)
    }

    /// Stop every attached worker. Used at shutdown; records stay as they are.
    pub async fn shutdown_all(&self) {
        let handles: Vec<_> = self.handles().drain().collect();
        for (session_id, handle) in handles {
            if let Err(err) = handle.terminate().await {
                warn!(session_id, %err, "worker did not stop cleanly during shutdown");
            }
        }
    }

    /// Reconcile records with an empty handle map after a restart.
    ///
    /// Workers do not survive the server, so every session that believed it
    /// had one is moved to `error` with reason `process_lost`. Returns how
    /// many sessions were touched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the session list cannot be read.
    pub async fn recover_on_startup(&self) -> Result<usize> {
        let stranded = self
            .repo
            .list_in(&[
                SessionState::Initializing,
                SessionState::Ready,
                SessionState::Processing,
            ])
            .await?;

        let mut recovered = 0;
        for session in &stranded {
            self.registry.register(&session.id);
            match self
                .record_error(&session.id, "server restarted; worker lost", REASON_PROCESS_LOST)
                .await
            {
                Ok(_) => recovered += 1,
                Err(err) => warn!(session_id = %session.id, %err, "failed to recover session"),
            }
        }
        for session in self.repo.list_in(&[SessionState::Created, SessionState::Error]).await? {
            self.registry.register(&session.id);
        }

        if recovered > 0 {
            info!(recovered, "stranded sessions moved to error");
        }
        Ok(recovered)
    }

    fn announce_state(&self, session: &Session) {
        self.hub.broadcast(
            BroadcastEvent::new(&session.id, EventType::SessionState)
                .with("state", state_str(session.state)),
        );
    }
}

fn same_handle(a: &Arc<dyn ProcessHandle>, b: &Arc<dyn ProcessHandle>) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}
