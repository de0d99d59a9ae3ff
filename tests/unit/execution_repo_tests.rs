use std::sync::Arc;

use agent_overseer::models::execution::{
    Execution, ExecutionLogEntry, FailedStep, LogLevel, RunStatus,
};
use agent_overseer::persistence::db;
use agent_overseer::persistence::execution_repo::ExecutionRepo;
use chrono::Utc;
use serde_json::json;

async fn repo() -> ExecutionRepo {
    let db = db::connect_memory().await.expect("db connect");
    ExecutionRepo::new(Arc::new(db))
}

#[tokio::test]
async fn create_starts_running() {
    let repo = repo().await;
    let execution = Execution::new("s1", Some("w1".into()));
    repo.create(&execution).await.expect("create");

    let stored = repo
        .get_by_id(&execution.id)
        .await
        .expect("query")
        .expect("execution");
    assert_eq!(stored.status, RunStatus::Running);
    assert_eq!(stored.work_item_id.as_deref(), Some("w1"));
    assert!(stored.completed_at.is_none());
    assert!(repo.get_by_id("missing").await.expect("query").is_none());
}

#[tokio::test]
async fn steps_are_recorded_in_order() {
    let repo = repo().await;
    let execution = Execution::new("s1", None);
    repo.create(&execution).await.expect("create");

    repo.start_step(&execution.id, 0, "render", "Render")
        .await
        .expect("start");
    let current = repo
        .get_by_id(&execution.id)
        .await
        .expect("query")
        .expect("execution");
    assert_eq!(current.current_step.as_deref(), Some("render"));

    repo.complete_step(&execution.id, 0, Some(&json!({ "prompt": "hi" })))
        .await
        .expect("complete");
    repo.start_step(&execution.id, 1, "dispatch", "Dispatch")
        .await
        .expect("start");
    repo.fail_step(&execution.id, 1, "worker gone")
        .await
        .expect("fail");

    let steps = repo.steps(&execution.id).await.expect("steps");
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].step_id, "render");
    assert_eq!(steps[0].status, RunStatus::Completed);
    assert_eq!(steps[0].result, Some(json!({ "prompt": "hi" })));
    assert_eq!(steps[1].status, RunStatus::Failed);
    assert_eq!(steps[1].error.as_deref(), Some("worker gone"));
    assert!(steps[1].completed_at.is_some());
}

#[tokio::test]
async fn completion_stores_result() {
    let repo = repo().await;
    let execution = Execution::new("s1", None);
    repo.create(&execution).await.expect("create");

    repo.complete(&execution.id, Some(&json!({ "deploy": { "url": "u" } })))
        .await
        .expect("complete");

    let stored = repo
        .get_by_id(&execution.id)
        .await
        .expect("query")
        .expect("execution");
    assert_eq!(stored.status, RunStatus::Completed);
    assert_eq!(stored.result, Some(json!({ "deploy": { "url": "u" } })));
    assert!(stored.current_step.is_none());
    assert!(stored.completed_at.is_some());
}

#[tokio::test]
async fn failure_records_step_identity_and_reason() {
    let repo = repo().await;
    let execution = Execution::new("s1", None);
    repo.create(&execution).await.expect("create");

    let failed = FailedStep {
        id: "health_check".into(),
        name: "Health check".into(),
    };
    repo.fail(&execution.id, Some(&failed), "503 from app", "step_failure")
        .await
        .expect("fail");

    let stored = repo
        .get_by_id(&execution.id)
        .await
        .expect("query")
        .expect("execution");
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.failed_step, Some(failed));
    assert_eq!(stored.error.as_deref(), Some("503 from app"));
    assert_eq!(stored.reason.as_deref(), Some("step_failure"));
}

#[tokio::test]
async fn failure_without_step_keeps_it_empty() {
    let repo = repo().await;
    let execution = Execution::new("s1", None);
    repo.create(&execution).await.expect("create");

    repo.fail(&execution.id, None, "no echo", "handshake_failure")
        .await
        .expect("fail");

    let stored = repo
        .get_by_id(&execution.id)
        .await
        .expect("query")
        .expect("execution");
    assert!(stored.failed_step.is_none());
    assert_eq!(stored.reason.as_deref(), Some("handshake_failure"));
}

#[tokio::test]
async fn logs_come_back_in_append_order() {
    let repo = repo().await;
    let execution = Execution::new("s1", None);
    repo.create(&execution).await.expect("create");

    for (level, message) in [(LogLevel::Info, "step started"), (LogLevel::Error, "boom")] {
        repo.append_log(&ExecutionLogEntry {
            execution_id: execution.id.clone(),
            step_id: Some("deploy".into()),
            level,
            message: message.into(),
            fields: json!({ "attempt": 1 }),
            timestamp: Utc::now(),
        })
        .await
        .expect("append");
    }

    let logs = repo.logs(&execution.id).await.expect("logs");
    let messages: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(messages, vec!["step started", "boom"]);
    assert_eq!(logs[1].level, LogLevel::Error);
    assert_eq!(logs[0].fields["attempt"], 1);
}

#[tokio::test]
async fn executions_are_listed_per_session() {
    let repo = repo().await;
    for session in ["s1", "s1", "s2"] {
        repo.create(&Execution::new(session, None))
            .await
            .expect("create");
    }
    assert_eq!(repo.list_for_session("s1").await.expect("list").len(), 2);
    assert_eq!(repo.list_for_session("s2").await.expect("list").len(), 1);
}
