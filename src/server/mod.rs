//! HTTP push/subscribe surface.
//!
//! - `POST /signal`: workers push tool-call signals.
//! - `GET /sessions/{session_id}/ws`: observers subscribe (replay, then live).
//! - `GET /sessions/{session_id}/status`: point-in-time session view.
//! - `GET /health`: liveness.

pub mod push;
pub mod subscribe;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::persistence::session_repo::state_str;
use crate::state::AppState;
use crate::{AppError, Result};

/// Error body returned by every route.
#[derive(Debug)]
pub struct ApiError(AppError);

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Config(_) | AppError::Serialization(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidTransition(_) => StatusCode::CONFLICT,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.0.to_string(), "reason": self.0.reason() });
        (status, Json(body)).into_response()
    }
}

/// Build the router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/signal", post(push::push_signal))
        .route("/sessions/{session_id}/status", get(session_status))
        .route("/sessions/{session_id}/ws", get(subscribe::subscribe))
        .with_state(state)
}

/// Serve on `127.0.0.1:<http_port>` until `ct` fires.
///
/// # Errors
///
/// Returns `AppError::Config` if the port cannot be bound or the server fails.
pub async fn serve_http(state: Arc<AppState>, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], state.config.http_port));
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind HTTP on {bind}: {err}")))?;
    serve_on(listener, state, ct).await
}

/// Serve on an already-bound listener until `ct` fires.
///
/// # Errors
///
/// Returns `AppError::Config` if the server fails.
pub async fn serve_on(listener: TcpListener, state: Arc<AppState>, ct: CancellationToken) -> Result<()> {
    let local = listener
        .local_addr()
        .map_err(|err| AppError::Config(format!("listener has no address: {err}")))?;
    info!(%local, "starting HTTP push/subscribe server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Config(format!("HTTP server error: {err}")))?;

    info!("HTTP server shut down");
    Ok(())
}

async fn health(axum::extract::State(state): axum::extract::State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "monitor_running": state.monitor.is_running(),
        "live_workers": state.sessions.live_handles().len(),
        "signal_backend": state.signals.name(),
    }))
}

/// Persisted record, transient registry state, and queue view of a session.
///
/// # Errors
///
/// Returns `AppError::NotFound` if the session does not exist.
pub async fn status_view(state: &AppState, session_id: &str) -> Result<Value> {
    let session = state.sessions.get_session(session_id).await?;
    let slots = state
        .monitor
        .monitor()
        .available_slots(session_id)
        .await?;
    Ok(json!({
        "session_id": session.id,
        "state": state_str(session.state),
        "health": session.health,
        "healthy": session.health.is_healthy(),
        "error_count": session.error_count,
        "last_error": session.last_error,
        "last_error_reason": session.last_error_reason,
        "updated_at": session.updated_at,
        "attached": state.sessions.handle(session_id).is_some(),
        "signals": state.registry.snapshot(session_id),
        "observers": state.hub.observer_count(session_id),
        "available_slots": slots,
    }))
}

async fn session_status(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    axum::extract::Path(session_id): axum::extract::Path<String>,
) -> std::result::Result<Json<Value>, ApiError> {
    Ok(Json(status_view(&state, &session_id).await?))
}
