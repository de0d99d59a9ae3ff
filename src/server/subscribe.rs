//! WebSocket subscription for one session's event stream.
//!
//! On connect the observer receives the session history, then live events,
//! never interleaved. Clients may send control messages:
//! `{"type":"ping"}`, `{"type":"get_status"}`, and `{"type":"reset"}`.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, info_span, warn, Instrument};

use super::{status_view, ApiError};
use crate::models::event::{BroadcastEvent, EventType};
use crate::state::AppState;
use crate::AppError;

/// Control messages accepted from subscribers.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    GetStatus,
    Reset,
}

/// `GET /sessions/{session_id}/ws`.
pub async fn subscribe(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    if !state.registry.contains(&session_id) {
        // Sessions created before a restart are known to the store only.
        state.sessions.get_session(&session_id).await?;
    }
    let span = info_span!("subscriber", session_id = %session_id);
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, session_id).instrument(span))
        .into_response())
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, session_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut observer = state.hub.connect(&session_id);
    info!(observer_id = observer.id(), "observer connected");

    loop {
        tokio::select! {
            event = observer.recv() => {
                let Some(event) = event else {
                    debug!("observer dropped by hub");
                    break;
                };
                if send_json(&mut ws_tx, &event).await.is_err() {
                    break;
                }
            }
            inbound = ws_rx.next() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(%err, "websocket receive failed");
                        break;
                    }
                };
                let reply = handle_control(&state, &session_id, text.as_str()).await;
                if let Some(reply) = reply {
                    if send_json(&mut ws_tx, &reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    info!(observer_id = observer.id(), "observer disconnected");
    state.hub.disconnect(observer);
}

async fn send_json<S, T>(ws_tx: &mut S, value: &T) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
    T: serde::Serialize,
{
    let Ok(text) = serde_json::to_string(value) else {
        return Ok(());
    };
    ws_tx.send(Message::Text(text.into())).await.map_err(drop)
}

/// Direct reply to a control message, if any. `reset` is answered through
/// the broadcast stream so every observer sees it.
async fn handle_control(state: &AppState, session_id: &str, text: &str) -> Option<Value> {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(err) => {
            return Some(json!({
                "type": "error",
                "message": format!("invalid control message: {err}"),
            }));
        }
    };

    match message {
        ClientMessage::Ping => Some(json!({ "type": "pong" })),
        ClientMessage::GetStatus => match status_view(state, session_id).await {
            Ok(status) => Some(json!({ "type": "status", "status": status })),
            Err(err) => Some(error_reply(&err)),
        },
        ClientMessage::Reset => {
            if let Err(err) = state.registry.reset(session_id) {
                return Some(error_reply(&err));
            }
            state
                .hub
                .broadcast(BroadcastEvent::new(session_id, EventType::Reset).with("ok", true));
            None
        }
    }
}

fn error_reply(err: &AppError) -> Value {
    json!({ "type": "error", "message": err.to_string(), "reason": err.reason() })
}
