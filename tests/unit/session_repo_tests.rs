use std::sync::Arc;

use agent_overseer::models::health::{HealthPatch, HealthStatus};
use agent_overseer::models::session::SessionState;
use agent_overseer::persistence::db;
use agent_overseer::persistence::session_repo::{state_str, SessionRepo};
use agent_overseer::AppError;
use chrono::Utc;

async fn repo() -> SessionRepo {
    let db = db::connect_memory().await.expect("db connect");
    SessionRepo::new(Arc::new(db))
}

#[tokio::test]
async fn in_memory_connect_creates_all_tables() {
    let pool = db::connect_memory().await.expect("db connect");
    for table in ["session", "work_item", "execution", "execution_step", "execution_log"] {
        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&pool)
            .await
            .unwrap_or_else(|e| panic!("table '{table}' should be queryable: {e}"));
        assert_eq!(row.0, 0, "table '{table}' should start empty");
    }
}

#[tokio::test]
async fn file_backed_connect_persists_across_pools() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("overseer.db");
    {
        let pool = db::connect(&path).await.expect("connect");
        SessionRepo::new(Arc::new(pool)).ensure("s1").await.expect("ensure");
    }
    let pool = db::connect(&path).await.expect("reconnect");
    let session = SessionRepo::new(Arc::new(pool))
        .get("s1")
        .await
        .expect("query");
    assert!(session.is_some());
}

#[tokio::test]
async fn ensure_creates_once() {
    let repo = repo().await;

    let (first, created) = repo.ensure("s1").await.expect("ensure");
    assert!(created);
    assert_eq!(first.state, SessionState::Created);

    repo.update_state("s1", SessionState::Initializing)
        .await
        .expect("transition");
    let (again, created) = repo.ensure("s1").await.expect("ensure again");
    assert!(!created);
    assert_eq!(again.state, SessionState::Initializing);
}

#[tokio::test]
async fn invalid_transition_is_rejected_and_state_kept() {
    let repo = repo().await;
    repo.ensure("s1").await.expect("ensure");

    let err = repo
        .update_state("s1", SessionState::Processing)
        .await
        .expect_err("created -> processing is not allowed");
    assert!(matches!(err, AppError::InvalidTransition(_)));
    assert_eq!(
        repo.get_by_id("s1").await.expect("get").state,
        SessionState::Created
    );
}

#[tokio::test]
async fn terminate_stamps_terminated_at() {
    let repo = repo().await;
    repo.ensure("s1").await.expect("ensure");

    let terminated = repo
        .update_state("s1", SessionState::Terminated)
        .await
        .expect("terminate");
    assert_eq!(terminated.state, SessionState::Terminated);
    assert!(terminated.terminated_at.is_some());

    let err = repo
        .update_state("s1", SessionState::Initializing)
        .await
        .expect_err("terminated is final");
    assert!(matches!(err, AppError::InvalidTransition(_)));
}

#[tokio::test]
async fn record_error_counts_and_keeps_reason() {
    let repo = repo().await;
    repo.ensure("s1").await.expect("ensure");

    repo.record_error("s1", "probe timed out", "handshake_failure")
        .await
        .expect("first error");
    let session = repo
        .record_error("s1", "spawn failed", "process_error")
        .await
        .expect("second error");

    assert_eq!(session.state, SessionState::Error);
    assert_eq!(session.error_count, 2);
    assert_eq!(session.last_error.as_deref(), Some("spawn failed"));
    assert_eq!(session.last_error_reason.as_deref(), Some("process_error"));
}

#[tokio::test]
async fn health_is_replaced_or_patched() {
    let repo = repo().await;
    repo.ensure("s1").await.expect("ensure");

    let session = repo
        .set_health("s1", &HealthStatus::healthy(Utc::now()))
        .await
        .expect("set");
    assert!(session.health.is_healthy());

    let session = repo
        .patch_health(
            "s1",
            &HealthPatch {
                process_exists: Some(false),
                ..HealthPatch::default()
            },
        )
        .await
        .expect("patch");
    assert!(!session.health.process_exists);
    assert!(session.health.probe_succeeded);
}

#[tokio::test]
async fn missing_session_is_not_found() {
    let repo = repo().await;
    assert!(repo.get("ghost").await.expect("query").is_none());
    assert!(matches!(
        repo.get_by_id("ghost").await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        repo.update_state("ghost", SessionState::Ready).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn concurrent_writers_do_not_lose_updates() {
    let repo = Arc::new(repo().await);
    repo.ensure("s1").await.expect("ensure");

    let mut tasks = Vec::new();
    for n in 0..8 {
        let repo = Arc::clone(&repo);
        tasks.push(tokio::spawn(async move {
            repo.record_error("s1", &format!("failure {n}"), "process_error")
                .await
                .expect("record");
        }));
    }
    for task in tasks {
        task.await.expect("join");
    }

    assert_eq!(repo.get_by_id("s1").await.expect("get").error_count, 8);
}

#[tokio::test]
async fn list_in_filters_by_state() {
    let repo = repo().await;
    repo.ensure("a").await.expect("ensure");
    repo.ensure("b").await.expect("ensure");
    repo.update_state("b", SessionState::Initializing)
        .await
        .expect("transition");

    let created = repo.list_in(&[SessionState::Created]).await.expect("list");
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].id, "a");
    assert_eq!(repo.list().await.expect("list").len(), 2);
}

#[test]
fn state_names_are_snake_case() {
    assert_eq!(state_str(SessionState::Initializing), "initializing");
    assert_eq!(state_str(SessionState::Terminated), "terminated");
}
