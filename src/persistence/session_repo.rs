//! Session repository for `SQLite` persistence.
//!
//! Every mutation is a read-modify-write guarded by the `revision` column,
//! so concurrent mutators of one session never lose each other's updates.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::models::health::{HealthPatch, HealthStatus};
use crate::models::session::{Session, SessionState};
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_opt_ts, parse_ts, ts};

/// Attempts before a contended revision check is reported as an error.
const MAX_CAS_ATTEMPTS: usize = 16;

/// Repository wrapper around `SQLite` for session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    state: String,
    created_at: String,
    updated_at: String,
    health: String,
    error_count: i64,
    last_error: Option<String>,
    last_error_reason: Option<String>,
    terminated_at: Option<String>,
    revision: i64,
}

impl SessionRow {
    fn into_session(self) -> Result<(Session, i64)> {
        let health: HealthStatus = serde_json::from_str(&self.health)
            .map_err(|e| AppError::Db(format!("invalid health: {e}")))?;
        let session = Session {
            state: parse_state(&self.state)?,
            created_at: parse_ts("created_at", &self.created_at)?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
            terminated_at: parse_opt_ts("terminated_at", self.terminated_at.as_deref())?,
            health,
            error_count: u32::try_from(self.error_count).unwrap_or(u32::MAX),
            last_error: self.last_error,
            last_error_reason: self.last_error_reason,
            id: self.id,
        };
        Ok((session, self.revision))
    }
}

fn parse_state(s: &str) -> Result<SessionState> {
    match s {
        "created" => Ok(SessionState::Created),
        "initializing" => Ok(SessionState::Initializing),
        "ready" => Ok(SessionState::Ready),
        "processing" => Ok(SessionState::Processing),
        "error" => Ok(SessionState::Error),
        "terminated" => Ok(SessionState::Terminated),
        other => Err(AppError::Db(format!("invalid session state: {other}"))),
    }
}

/// Storage string for a session state.
#[must_use]
pub fn state_str(state: SessionState) -> &'static str {
    match state {
        SessionState::Created => "created",
        SessionState::Initializing => "initializing",
        SessionState::Ready => "ready",
        SessionState::Processing => "processing",
        SessionState::Error => "error",
        SessionState::Terminated => "terminated",
    }
}

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a session in `created` state unless one already exists.
    ///
    /// Returns the stored session and whether this call created it. An
    /// existing record is returned untouched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert or read-back fails.
    pub async fn ensure(&self, id: &str) -> Result<(Session, bool)> {
        let fresh = Session::new(id);
        let health = serde_json::to_string(&fresh.health)?;
        let now = ts(fresh.created_at);

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO session (id, state, created_at, updated_at, health)
             VALUES (?1, 'created', ?2, ?2, ?3)",
        )
        .bind(id)
        .bind(&now)
        .bind(&health)
        .execute(self.db.as_ref())
        .await?
        .rows_affected()
            == 1;

        let session = self.get_by_id(id).await?;
        Ok((session, inserted))
    }

    /// Retrieve a session by identifier, if present.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.fetch(id).await?.map(|(session, _)| session))
    }

    /// Retrieve a session by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn get_by_id(&self, id: &str) -> Result<Session> {
        self.get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))
    }

    /// List every session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self) -> Result<Vec<Session>> {
        let rows: Vec<SessionRow> = sqlx::query_as("SELECT * FROM session ORDER BY created_at")
            .fetch_all(self.db.as_ref())
            .await?;
        rows.into_iter()
            .map(|row| row.into_session().map(|(session, _)| session))
            .collect()
    }

    /// List sessions in one of the given states.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_in(&self, states: &[SessionState]) -> Result<Vec<Session>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|session| states.contains(&session.state))
            .collect())
    }

    /// Move a session to `next`, enforcing the lifecycle state machine.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the transition is not allowed,
    /// `AppError::NotFound` if the session does not exist.
    pub async fn update_state(&self, id: &str, next: SessionState) -> Result<Session> {
        self.mutate(id, |session| {
            if !session.can_transition_to(next) {
                return Err(AppError::InvalidTransition(format!(
                    "session {id}: {} -> {}",
                    state_str(session.state),
                    state_str(next)
                )));
            }
            session.state = next;
            if next == SessionState::Terminated {
                session.terminated_at = Some(Utc::now());
            }
            Ok(())
        })
        .await
    }

    /// Move a session to `error`, recording the failure detail.
    ///
    /// A session already in `error` keeps its state and has the detail
    /// replaced. Terminated sessions are rejected.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` for terminated sessions.
    pub async fn record_error(&self, id: &str, message: &str, reason: &str) -> Result<Session> {
        self.mutate(id, |session| {
            if session.state != SessionState::Error {
                if !session.can_transition_to(SessionState::Error) {
                    return Err(AppError::InvalidTransition(format!(
                        "session {id}: {} -> error",
                        state_str(session.state)
                    )));
                }
                session.state = SessionState::Error;
            }
            session.error_count = session.error_count.saturating_add(1);
            session.last_error = Some(message.to_owned());
            session.last_error_reason = Some(reason.to_owned());
            Ok(())
        })
        .await
    }

    /// Replace the stored health status wholesale.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn set_health(&self, id: &str, health: &HealthStatus) -> Result<Session> {
        self.mutate(id, |session| {
            session.health = health.clone();
            Ok(())
        })
        .await
    }

    /// Merge a partial health update into the stored status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn patch_health(&self, id: &str, patch: &HealthPatch) -> Result<Session> {
        self.mutate(id, |session| {
            session.health.apply(patch);
            Ok(())
        })
        .await
    }

    async fn fetch(&self, id: &str) -> Result<Option<(Session, i64)>> {
        let row: Option<SessionRow> = sqlx::query_as("SELECT * FROM session WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(SessionRow::into_session).transpose()
    }

    /// Apply `change` to the current record and write it back if nobody
    /// else wrote in between; otherwise re-read and try again.
    async fn mutate<F>(&self, id: &str, mut change: F) -> Result<Session>
    where
        F: FnMut(&mut Session) -> Result<()>,
    {
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let (mut session, revision) = self
                .fetch(id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))?;

            change(&mut session)?;
            session.updated_at = Utc::now();

            let written = sqlx::query(
                "UPDATE session SET state = ?1, updated_at = ?2, health = ?3, error_count = ?4,
                 last_error = ?5, last_error_reason = ?6, terminated_at = ?7,
                 revision = revision + 1
                 WHERE id = ?8 AND revision = ?9",
            )
            .bind(state_str(session.state))
            .bind(ts(session.updated_at))
            .bind(serde_json::to_string(&session.health)?)
            .bind(i64::from(session.error_count))
            .bind(&session.last_error)
            .bind(&session.last_error_reason)
            .bind(session.terminated_at.map(ts))
            .bind(id)
            .bind(revision)
            .execute(self.db.as_ref())
            .await?
            .rows_affected();

            if written == 1 {
                return Ok(session);
            }
            debug!(session_id = id, attempt, "session revision moved, retrying");
        }

        Err(AppError::Db(format!(
            "session {id} update lost {MAX_CAS_ATTEMPTS} consecutive revision races"
        )))
    }
}
