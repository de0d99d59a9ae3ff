//! Local IPC server for `agent-overseer-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands
//! and routes them to the queue monitor and session manager.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "list"}
//! {"command": "slots"}
//! {"command": "reclaim", "id": "item-123"}
//! {"command": "monitor_start"}
//! {"command": "status", "id": "session-1"}
//! {"command": "enqueue", "id": "session-1", "payload": {"type": "verify", "url": "https://example.com"}}
//! {"command": "resize", "id": "session-1", "rows": 50, "cols": 200}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "not found"}
//! ```

use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::models::work_item::JobPayload;
use crate::persistence::session_repo::state_str;
use crate::persistence::work_item_repo::WorkItemRepo;
use crate::state::AppState;
use crate::{AppError, Result};

/// Inbound IPC request from `agent-overseer-ctl`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct IpcRequest {
    /// Command verb.
    pub command: String,
    /// Session or work item identifier, depending on the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Job payload for `enqueue`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<JobPayload>,
    /// Terminal rows for `resize`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    /// Terminal columns for `resize`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    /// Shared-secret authentication token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// Outbound IPC response to `agent-overseer-ctl`.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    fn from_result(result: Result<serde_json::Value>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(err) => Self::error(err.to_string()),
        }
    }
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    state: Arc<AppState>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = state.config.ipc_name.clone();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                let state = Arc::clone(&state);
                                tokio::spawn(handle_connection(stream, state));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Handle a single IPC client connection.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    state: Arc<AppState>,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let mut response_line = handle_line(&state, trimmed).await;
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Decode one request line, run it, and encode the response.
pub async fn handle_line(state: &Arc<AppState>, line: &str) -> String {
    let response = match serde_json::from_str::<IpcRequest>(line) {
        Ok(request) => dispatch_command(&request, state).await,
        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
    };
    serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"ok":false,"error":"serialization failed"}"#.to_owned())
}

/// Route an IPC command to the appropriate handler.
pub async fn dispatch_command(request: &IpcRequest, state: &Arc<AppState>) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    async {
        // Validate shared-secret auth token when configured.
        if let Some(ref expected) = state.ipc_auth_token {
            match request.auth_token {
                Some(ref provided) if provided == expected => {}
                _ => {
                    warn!(command = %request.command, "IPC request rejected: invalid auth token");
                    return IpcResponse::error("unauthorized");
                }
            }
        }

        match request.command.as_str() {
            "list" => IpcResponse::from_result(handle_list(state).await),
            "slots" => IpcResponse::from_result(handle_slots(state).await),
            "reclaim" => IpcResponse::from_result(handle_reclaim(request, state).await),
            "monitor_start" => {
                let started = state.monitor.start().await;
                info!(started, "monitor start requested via IPC");
                IpcResponse::success(json!({ "running": true, "changed": started }))
            }
            "monitor_stop" => {
                let stopped = state.monitor.stop().await;
                info!(stopped, "monitor stop requested via IPC");
                IpcResponse::success(json!({ "running": false, "changed": stopped }))
            }
            "status" => IpcResponse::from_result(handle_status(request, state).await),
            "cleanup" => IpcResponse::from_result(handle_cleanup(request, state).await),
            "enqueue" => IpcResponse::from_result(handle_enqueue(request, state).await),
            "terminate" => IpcResponse::from_result(handle_terminate(request, state).await),
            "resize" => IpcResponse::from_result(handle_resize(request, state).await),
            other => IpcResponse::error(format!("unknown command: {other}")),
        }
    }
    .instrument(span)
    .await
}

fn required_id(request: &IpcRequest) -> Result<&str> {
    request
        .id
        .as_deref()
        .ok_or_else(|| AppError::Ipc("missing required 'id' field".into()))
}

/// List every session with its state and health.
async fn handle_list(state: &Arc<AppState>) -> Result<serde_json::Value> {
    let sessions = state.sessions.list_sessions().await?;
    let items: Vec<serde_json::Value> = sessions
        .iter()
        .map(|s| {
            json!({
                "session_id": s.id,
                "state": state_str(s.state),
                "healthy": s.health.is_healthy(),
                "attached": state.sessions.handle(&s.id).is_some(),
                "error_count": s.error_count,
                "last_error": s.last_error,
                "updated_at": s.updated_at.to_rfc3339(),
            })
        })
        .collect();
    Ok(json!({ "sessions": items }))
}

/// Running and pending counts per session against the limit.
async fn handle_slots(state: &Arc<AppState>) -> Result<serde_json::Value> {
    let queue = state.monitor.monitor();
    let usage = queue.slot_usage().await?;
    Ok(json!({ "limit": queue.concurrency_limit(), "sessions": usage }))
}

/// Force-reclaim one running work item.
async fn handle_reclaim(request: &IpcRequest, state: &Arc<AppState>) -> Result<serde_json::Value> {
    let item = state.monitor.monitor().force_reclaim(required_id(request)?).await?;
    info!(item_id = %item.id, "work item reclaimed via IPC");
    Ok(serde_json::to_value(&item)?)
}

/// Monitor state, plus one session's record and queue when `id` is set.
async fn handle_status(request: &IpcRequest, state: &Arc<AppState>) -> Result<serde_json::Value> {
    let mut data = json!({
        "monitor_running": state.monitor.is_running(),
        "signal_backend": state.signals.name(),
    });
    if let Some(session_id) = request.id.as_deref() {
        let session = state.sessions.get_session(session_id).await?;
        let items = WorkItemRepo::new(Arc::clone(&state.db))
            .list_for_session(session_id)
            .await?;
        data["session"] = serde_json::to_value(&session)?;
        data["work_items"] = serde_json::to_value(&items)?;
        data["observers"] = json!(state.hub.observer_count(session_id));
    }
    Ok(data)
}

/// Archive finished work items of a session.
async fn handle_cleanup(request: &IpcRequest, state: &Arc<AppState>) -> Result<serde_json::Value> {
    let session_id = required_id(request)?;
    let archived = WorkItemRepo::new(Arc::clone(&state.db))
        .archive_finished(session_id)
        .await?;
    info!(session_id, archived, "work items archived via IPC");
    Ok(json!({ "session_id": session_id, "archived": archived }))
}

/// Queue a job for a session, creating the session record if needed.
async fn handle_enqueue(request: &IpcRequest, state: &Arc<AppState>) -> Result<serde_json::Value> {
    let session_id = required_id(request)?;
    let payload = request
        .payload
        .clone()
        .ok_or_else(|| AppError::Ipc("missing required 'payload' field".into()))?;
    state.sessions.initialize_structure(session_id).await?;
    let item = state.monitor.monitor().enqueue(session_id, payload).await?;
    Ok(serde_json::to_value(&item)?)
}

/// Stop a session's worker and mark it terminated.
async fn handle_terminate(request: &IpcRequest, state: &Arc<AppState>) -> Result<serde_json::Value> {
    let session = state.sessions.terminate_session(required_id(request)?).await?;
    Ok(json!({ "session_id": session.id, "state": state_str(session.state) }))
}

/// Change the terminal size of a session's attached worker.
async fn handle_resize(request: &IpcRequest, state: &Arc<AppState>) -> Result<serde_json::Value> {
    let session_id = required_id(request)?;
    let (Some(rows), Some(cols)) = (request.rows, request.cols) else {
        return Err(AppError::Ipc("missing required 'rows' and 'cols' fields".into()));
    };
    if rows == 0 || cols == 0 {
        return Err(AppError::Ipc("'rows' and 'cols' must be positive".into()));
    }
    let handle = state
        .sessions
        .handle(session_id)
        .ok_or_else(|| AppError::NotFound(format!("no worker attached to session {session_id}")))?;
    handle.resize(rows, cols).await?;
    info!(session_id, rows, cols, "worker resized via IPC");
    Ok(json!({ "session_id": session_id, "rows": rows, "cols": cols }))
}
