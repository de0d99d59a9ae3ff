//! Completion detection backends: marker files, fresh artifacts, and
//! registry-backed tool-call pushes.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use agent_overseer::models::outcome::SignalKind;
use agent_overseer::registry::SessionRegistry;
use agent_overseer::signal::{ArtifactSignal, CompletionSignal, MarkerSignal, ToolCallSignal};
use agent_overseer::storage::StorageHandle;
use agent_overseer::AppError;

const POLL: Duration = Duration::from_millis(20);

fn marker_backend(dir: &std::path::Path) -> MarkerSignal {
    MarkerSignal::new(dir.to_path_buf(), POLL, Duration::ZERO)
}

#[tokio::test]
async fn marker_done_resolves_when_file_appears() {
    let dir = tempfile::tempdir().expect("tempdir");
    let signals = marker_backend(dir.path());
    signals.begin("s1").await.expect("begin");

    let marker = StorageHandle::new(dir.path(), "s1").marker_path(SignalKind::Done);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::fs::write(&marker, "all good\n").await.expect("write marker");
    });

    let outcome = signals
        .await_signal("s1", SignalKind::Done, Duration::from_secs(5))
        .await
        .expect("done marker");
    assert_eq!(outcome.kind, SignalKind::Done);
    assert_eq!(outcome.payload["content"], "all good");
}

#[tokio::test]
async fn marker_begin_clears_leftover_markers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let signals = marker_backend(dir.path());
    let storage = StorageHandle::new(dir.path(), "s1");
    storage.create_dirs().await.expect("dirs");
    std::fs::write(storage.marker_path(SignalKind::Done), "old").expect("stale marker");

    signals.begin("s1").await.expect("begin");

    assert!(!storage.marker_path(SignalKind::Done).exists());
    let result = signals
        .await_signal("s1", SignalKind::Done, Duration::from_millis(200))
        .await;
    assert!(matches!(result, Err(AppError::SignalTimeout(_))));
}

#[tokio::test]
async fn marker_timeout_never_fires_early() {
    let dir = tempfile::tempdir().expect("tempdir");
    let signals = marker_backend(dir.path());
    signals.begin("s1").await.expect("begin");

    let timeout = Duration::from_millis(300);
    let started = tokio::time::Instant::now();
    let result = signals.await_signal("s1", SignalKind::Ack, timeout).await;

    assert!(matches!(result, Err(AppError::SignalTimeout(_))));
    assert!(started.elapsed() >= timeout);
}

#[tokio::test]
async fn marker_done_wait_ends_on_error_marker() {
    let dir = tempfile::tempdir().expect("tempdir");
    let signals = marker_backend(dir.path());
    signals.begin("s1").await.expect("begin");
    let storage = StorageHandle::new(dir.path(), "s1");
    std::fs::write(storage.marker_path(SignalKind::Error), "disk full").expect("error marker");

    let outcome = signals
        .await_signal("s1", SignalKind::Done, Duration::from_secs(2))
        .await
        .expect("error marker observed");

    assert_eq!(outcome.kind, SignalKind::Error);
    assert!(outcome.is_failure());
    assert_eq!(outcome.payload["content"], "disk full");
}

#[tokio::test]
async fn artifact_modified_before_begin_is_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let signals = ArtifactSignal::new(dir.path().to_path_buf(), "result.md", 1, POLL);
    let path = signals.artifact_path("s1");
    std::fs::create_dir_all(path.parent().expect("parent")).expect("output dir");
    let file = std::fs::File::create(&path).expect("create artifact");
    std::io::Write::write_all(&mut &file, b"result from an earlier run").expect("write");
    file.set_modified(SystemTime::now() - Duration::from_secs(3600))
        .expect("backdate");
    drop(file);

    signals.begin("s1").await.expect("begin");
    let result = signals
        .await_signal("s1", SignalKind::Done, Duration::from_millis(300))
        .await;

    assert!(matches!(result, Err(AppError::SignalTimeout(_))), "got {result:?}");
}

#[tokio::test]
async fn artifact_written_right_after_begin_is_fresh() {
    let dir = tempfile::tempdir().expect("tempdir");
    let signals = ArtifactSignal::new(dir.path().to_path_buf(), "result.md", 1, POLL);
    let path = signals.artifact_path("s1");

    for round in 0..25 {
        signals.begin("s1").await.expect("begin");
        std::fs::write(&path, format!("result {round}")).expect("artifact");

        let outcome = signals
            .await_signal("s1", SignalKind::Done, Duration::from_millis(500))
            .await
            .unwrap_or_else(|err| panic!("round {round}: fresh artifact rejected: {err}"));
        assert_eq!(outcome.kind, SignalKind::Done);
    }
}

#[tokio::test]
async fn artifact_needs_minimum_size_for_done() {
    let dir = tempfile::tempdir().expect("tempdir");
    let signals = ArtifactSignal::new(dir.path().to_path_buf(), "result.md", 16, POLL);
    signals.begin("s1").await.expect("begin");
    let path = signals.artifact_path("s1");
    std::fs::write(&path, "tiny").expect("small artifact");

    let ack = signals
        .await_signal("s1", SignalKind::Ack, Duration::from_secs(2))
        .await
        .expect("any fresh file acknowledges");
    assert_eq!(ack.kind, SignalKind::Ack);

    let early = signals
        .await_signal("s1", SignalKind::Done, Duration::from_millis(200))
        .await;
    assert!(matches!(early, Err(AppError::SignalTimeout(_))));

    std::fs::write(&path, "a complete summary of the work").expect("full artifact");
    let done = signals
        .await_signal("s1", SignalKind::Done, Duration::from_secs(2))
        .await
        .expect("done");
    assert_eq!(done.kind, SignalKind::Done);
    assert_eq!(done.payload["bytes"], 30);
}

#[tokio::test]
async fn artifact_error_file_fails_the_wait() {
    let dir = tempfile::tempdir().expect("tempdir");
    let signals = ArtifactSignal::new(dir.path().to_path_buf(), "result.md", 1, POLL);
    signals.begin("s1").await.expect("begin");
    let error_path = signals.artifact_path("s1").with_file_name("result.md.error");
    std::fs::write(&error_path, "compile failed\n").expect("error file");

    let outcome = signals
        .await_signal("s1", SignalKind::Done, Duration::from_secs(2))
        .await
        .expect("error observed");

    assert_eq!(outcome.kind, SignalKind::Error);
    assert_eq!(outcome.payload["message"], "compile failed");
}

#[tokio::test]
async fn tool_call_ack_releases_waiter() {
    let registry = Arc::new(SessionRegistry::new());
    let signals = ToolCallSignal::new(Arc::clone(&registry));
    signals.begin("s1").await.expect("begin");

    let pusher = Arc::clone(&registry);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        pusher.set_ack("s1").expect("ack");
    });

    let outcome = signals
        .await_signal("s1", SignalKind::Ack, Duration::from_secs(2))
        .await
        .expect("ack");
    assert_eq!(outcome.kind, SignalKind::Ack);
}

#[tokio::test]
async fn tool_call_begin_discards_earlier_response() {
    let registry = Arc::new(SessionRegistry::new());
    let signals = ToolCallSignal::new(Arc::clone(&registry));
    registry.register("s1");
    registry.set_response("s1", "answer to the previous prompt").expect("response");

    signals.begin("s1").await.expect("begin");
    let result = signals
        .await_signal("s1", SignalKind::Done, Duration::from_millis(200))
        .await;

    assert!(matches!(result, Err(AppError::SignalTimeout(_))));
}

#[tokio::test]
async fn tool_call_begin_requires_a_fresh_completion() {
    let registry = Arc::new(SessionRegistry::new());
    let signals = ToolCallSignal::new(Arc::clone(&registry));
    registry.register("s1");
    registry
        .set_complete("s1", true, serde_json::json!({ "task": "previous" }))
        .expect("complete");

    signals.begin("s1").await.expect("begin");
    let stale = signals
        .await_signal("s1", SignalKind::Done, Duration::from_millis(100))
        .await;
    assert!(matches!(stale, Err(AppError::SignalTimeout(_))), "got {stale:?}");

    registry
        .set_complete("s1", true, serde_json::json!({ "task": "current" }))
        .expect("complete");
    let outcome = signals
        .await_signal("s1", SignalKind::Done, Duration::from_secs(1))
        .await
        .expect("fresh completion");
    assert_eq!(outcome.kind, SignalKind::Done);
    assert_eq!(outcome.payload["detail"]["task"], "current");
}

#[tokio::test]
async fn tool_call_error_ends_completion_wait() {
    let registry = Arc::new(SessionRegistry::new());
    let signals = ToolCallSignal::new(Arc::clone(&registry));
    signals.begin("s1").await.expect("begin");
    registry.set_error("s1", "tests failed", true).expect("error");

    let outcome = signals
        .await_signal("s1", SignalKind::Done, Duration::from_secs(1))
        .await
        .expect("outcome");

    assert_eq!(outcome.kind, SignalKind::Error);
    assert_eq!(outcome.payload["message"], "tests failed");
    assert_eq!(outcome.payload["recoverable"], true);
}
