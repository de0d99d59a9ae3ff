//! Tool-call push endpoint.
//!
//! Workers report `ack`, `progress`, `status`, `response`, `complete`, and
//! `error` here. Each push updates the session registry, which releases
//! any waiter blocked on it, and is fanned out to observers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::ApiError;
use crate::models::event::{BroadcastEvent, EventType};
use crate::state::AppState;
use crate::AppError;

/// Body of `POST /signal`.
#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    /// Target session.
    pub session_id: String,
    /// Signal kind.
    pub kind: String,
    /// Kind-specific detail.
    #[serde(default)]
    pub payload: Value,
}

/// Kinds accepted by the push endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    /// Task acknowledged.
    Ack,
    /// Progress percentage.
    Progress,
    /// Free-form status line.
    Status,
    /// Response body.
    Response,
    /// Task finished.
    Complete,
    /// Task failed.
    Error,
}

impl PushKind {
    /// Parse a wire name.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an unknown kind.
    pub fn parse(raw: &str) -> crate::Result<Self> {
        match raw {
            "ack" => Ok(Self::Ack),
            "progress" => Ok(Self::Progress),
            "status" => Ok(Self::Status),
            "response" => Ok(Self::Response),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            other => Err(AppError::Config(format!("unknown signal kind: {other}"))),
        }
    }
}

fn text_field<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| payload.get(*key).and_then(Value::as_str))
}

fn percent_field(payload: &Value) -> Option<u8> {
    let raw = payload
        .get("percent")
        .or_else(|| payload.get("progress"))
        .or_else(|| payload.is_number().then_some(payload))?
        .as_f64()?;
    // Clamped to 0..=100 before the cast.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let percent = raw.clamp(0.0, 100.0).round() as u8;
    Some(percent)
}

/// Apply a push to the registry and fan it out. Returns observers reached.
///
/// # Errors
///
/// Returns `AppError::NotFound` for an unregistered session and
/// `AppError::Config` for a malformed payload.
pub fn apply_signal(
    state: &AppState,
    session_id: &str,
    kind: PushKind,
    payload: &Value,
) -> crate::Result<usize> {
    let registry = &state.registry;
    let event = match kind {
        PushKind::Ack => {
            registry.set_ack(session_id)?;
            BroadcastEvent::new(session_id, EventType::Ack)
        }
        PushKind::Progress => {
            let percent = percent_field(payload)
                .ok_or_else(|| AppError::Config("progress needs a numeric percent".into()))?;
            registry.set_progress(session_id, percent)?;
            let mut event =
                BroadcastEvent::new(session_id, EventType::Progress).with("percent", percent);
            if let Some(message) = text_field(payload, &["message"]) {
                registry.set_status(session_id, message)?;
                event = event.with("message", message);
            }
            event
        }
        PushKind::Status => {
            let message = text_field(payload, &["message", "status"])
                .or_else(|| payload.as_str())
                .ok_or_else(|| AppError::Config("status needs a message".into()))?;
            registry.set_status(session_id, message)?;
            BroadcastEvent::new(session_id, EventType::Status).with("message", message)
        }
        PushKind::Response => {
            let content = text_field(payload, &["content", "response"])
                .or_else(|| payload.as_str())
                .ok_or_else(|| AppError::Config("response needs content".into()))?;
            registry.set_response(session_id, content)?;
            BroadcastEvent::new(session_id, EventType::Response).with("content", content)
        }
        PushKind::Complete => {
            let success = payload
                .get("success")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            registry.set_complete(session_id, success, payload.clone())?;
            BroadcastEvent::new(session_id, EventType::Complete)
                .with("success", success)
                .with("payload", payload.clone())
        }
        PushKind::Error => {
            let message = text_field(payload, &["message", "error"])
                .or_else(|| payload.as_str())
                .unwrap_or("worker reported an error");
            let recoverable = payload
                .get("recoverable")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            registry.set_error(session_id, message, recoverable)?;
            BroadcastEvent::new(session_id, EventType::Error)
                .with("message", message)
                .with("reason", "worker_error")
                .with("recoverable", recoverable)
        }
    };
    Ok(state.hub.broadcast(event))
}

/// `POST /signal`.
pub async fn push_signal(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SignalRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let kind = PushKind::parse(&request.kind)?;
    if !state.registry.contains(&request.session_id) {
        return Err(AppError::NotFound(format!(
            "session {} is not registered",
            request.session_id
        ))
        .into());
    }

    let delivered = apply_signal(&state, &request.session_id, kind, &request.payload)?;
    debug!(session_id = %request.session_id, kind = %request.kind, delivered, "signal pushed");
    if kind == PushKind::Complete || kind == PushKind::Error {
        info!(session_id = %request.session_id, kind = %request.kind, "worker reported a terminal signal");
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": true, "delivered": delivered })),
    ))
}
