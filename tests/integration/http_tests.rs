//! HTTP push/subscribe surface over a real listener: health, signal push,
//! status, and the WebSocket replay-then-live stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use agent_overseer::models::event::{BroadcastEvent, EventType};
use agent_overseer::server::serve_on;
use agent_overseer::state::AppState;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::test_helpers::{build_state, test_config, Behavior, MockSpawner};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    _dir: tempfile::TempDir,
    state: Arc<AppState>,
    addr: SocketAddr,
    ct: CancellationToken,
}

impl Server {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.ct.cancel();
    }
}

async fn start() -> Server {
    let dir = tempfile::tempdir().expect("tempdir");
    let spawner = Arc::new(MockSpawner::new(Behavior::Echo));
    let state = build_state(test_config(dir.path()), spawner).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let ct = CancellationToken::new();
    tokio::spawn(serve_on(listener, Arc::clone(&state), ct.clone()));
    Server {
        _dir: dir,
        state,
        addr,
        ct,
    }
}

async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("message in time")
            .expect("stream open")
            .expect("frame");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("json frame");
        }
    }
}

async fn send_json(socket: &mut Socket, value: &Value) {
    socket
        .send(Message::Text(value.to_string()))
        .await
        .expect("send");
}

#[tokio::test]
async fn health_reports_runtime_summary() {
    let server = start().await;
    server.state.sessions.create_session("alpha").await.expect("create");

    let body: Value = reqwest::get(server.url("/health"))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");

    assert_eq!(body["status"], "ok");
    assert_eq!(body["monitor_running"], false);
    assert_eq!(body["live_workers"], 1);
    assert_eq!(body["signal_backend"], "tool_call");
}

#[tokio::test]
async fn pushed_signal_is_accepted_and_visible_in_status() {
    let server = start().await;
    server.state.sessions.create_session("alpha").await.expect("create");
    let client = reqwest::Client::new();

    let response = client
        .post(server.url("/signal"))
        .json(&json!({
            "session_id": "alpha",
            "kind": "progress",
            "payload": { "percent": 40, "message": "compiling" },
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status().as_u16(), 202);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["accepted"], true);

    let status: Value = client
        .get(server.url("/sessions/alpha/status"))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(status["state"], "ready");
    assert_eq!(status["attached"], true);
    assert_eq!(status["signals"]["progress"], 40);
    assert_eq!(status["signals"]["last_message"], "compiling");
    assert_eq!(status["available_slots"], 1);
}

#[tokio::test]
async fn signal_for_unknown_session_or_kind_is_rejected() {
    let server = start().await;
    server.state.sessions.create_session("alpha").await.expect("create");
    let client = reqwest::Client::new();

    let unknown_session = client
        .post(server.url("/signal"))
        .json(&json!({ "session_id": "ghost", "kind": "ack" }))
        .send()
        .await
        .expect("request");
    assert_eq!(unknown_session.status().as_u16(), 404);
    let body: Value = unknown_session.json().await.expect("json");
    assert_eq!(body["reason"], "not_found");

    let bad_kind = client
        .post(server.url("/signal"))
        .json(&json!({ "session_id": "alpha", "kind": "celebrate" }))
        .send()
        .await
        .expect("request");
    assert_eq!(bad_kind.status().as_u16(), 400);
    let body: Value = bad_kind.json().await.expect("json");
    assert_eq!(body["reason"], "config_error");

    let missing = client
        .get(server.url("/sessions/ghost/status"))
        .send()
        .await
        .expect("request");
    assert_eq!(missing.status().as_u16(), 404);
}

#[tokio::test]
async fn websocket_replays_history_then_streams_live_events() {
    let server = start().await;
    server.state.sessions.create_session("alpha").await.expect("create");
    server
        .state
        .hub
        .broadcast(BroadcastEvent::new("alpha", EventType::Status).with("message", "earlier"));

    let (mut socket, _) = connect_async(format!("ws://{}/sessions/alpha/ws", server.addr))
        .await
        .expect("connect");

    // Session creation events come first, then the status line.
    let mut replayed = Vec::new();
    loop {
        let event = next_json(&mut socket).await;
        let done = event["type"] == "status";
        replayed.push(event);
        if done {
            break;
        }
    }
    assert_eq!(replayed.last().expect("event")["fields"]["message"], "earlier");
    assert!(replayed.iter().all(|e| e["session_id"] == "alpha"));

    send_json(&mut socket, &json!({ "type": "ping" })).await;
    assert_eq!(next_json(&mut socket).await, json!({ "type": "pong" }));

    let pushed = reqwest::Client::new()
        .post(server.url("/signal"))
        .json(&json!({ "session_id": "alpha", "kind": "ack" }))
        .send()
        .await
        .expect("request");
    assert_eq!(pushed.status().as_u16(), 202);
    assert_eq!(next_json(&mut socket).await["type"], "ack");

    send_json(&mut socket, &json!({ "type": "reset" })).await;
    let reset = next_json(&mut socket).await;
    assert_eq!(reset["type"], "reset");
    assert_eq!(reset["fields"]["ok"], true);
    let snapshot = server.state.registry.snapshot("alpha").expect("registered");
    assert!(!snapshot.acked);

    send_json(&mut socket, &json!({ "type": "get_status" })).await;
    let status = next_json(&mut socket).await;
    assert_eq!(status["type"], "status");
    assert_eq!(status["status"]["session_id"], "alpha");

    socket
        .send(Message::Text("not json".into()))
        .await
        .expect("send");
    assert_eq!(next_json(&mut socket).await["type"], "error");
}

#[tokio::test]
async fn websocket_for_unknown_session_is_refused() {
    let server = start().await;
    let result = connect_async(format!("ws://{}/sessions/ghost/ws", server.addr)).await;
    assert!(result.is_err());
}
