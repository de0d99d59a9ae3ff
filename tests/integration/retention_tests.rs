//! Retention purge: expired sessions lose their records, journal, and
//! directory. Everything else survives.

use std::sync::Arc;

use agent_overseer::broadcast::journal::EventJournal;
use agent_overseer::models::event::{BroadcastEvent, EventType};
use agent_overseer::models::execution::Execution;
use agent_overseer::models::work_item::{JobPayload, WorkItem, WorkStatus};
use agent_overseer::persistence::execution_repo::ExecutionRepo;
use agent_overseer::persistence::retention::{purge, PurgeReport, RetentionFiles};
use agent_overseer::persistence::session_repo::SessionRepo;
use agent_overseer::persistence::work_item_repo::WorkItemRepo;
use agent_overseer::state::AppState;
use chrono::{Duration, Utc};

use super::test_helpers::{build_state, test_config, Behavior, MockSpawner};

fn verify_job() -> JobPayload {
    JobPayload::Verify {
        url: "https://app.example.test".into(),
    }
}

struct Seeded {
    _dir: tempfile::TempDir,
    state: Arc<AppState>,
    journal: EventJournal,
}

/// Two sessions with an execution, a work item, and journal lines each;
/// `old` is terminated.
async fn seed() -> Seeded {
    let dir = tempfile::tempdir().expect("tempdir");
    let spawner = Arc::new(MockSpawner::new(Behavior::Echo));
    let state = build_state(test_config(dir.path()), spawner).await;
    let journal = EventJournal::new(dir.path().join("journal")).expect("journal");

    let executions = ExecutionRepo::new(Arc::clone(&state.db));
    let work_items = WorkItemRepo::new(Arc::clone(&state.db));
    for id in ["old", "live"] {
        state.sessions.create_session(id).await.expect("create");
        executions
            .create(&Execution::new(id, None))
            .await
            .expect("execution");
        work_items
            .enqueue(&WorkItem::new(id, verify_job()))
            .await
            .expect("work item");
        journal
            .append(&BroadcastEvent::new(id, EventType::Status).with("message", "hello"))
            .expect("journal append");
    }
    state.sessions.terminate_session("old").await.expect("terminate");

    Seeded {
        _dir: dir,
        state,
        journal,
    }
}

fn files(seeded: &Seeded) -> RetentionFiles {
    RetentionFiles {
        sessions_dir: seeded.state.config.sessions_dir(),
        journal: Some(seeded.journal.clone()),
    }
}

#[tokio::test]
async fn purge_removes_expired_sessions_with_their_data() {
    let seeded = seed().await;
    let old_dir = seeded.state.sessions.storage("old").root;
    let live_dir = seeded.state.sessions.storage("live").root;
    assert!(old_dir.is_dir());

    let report = purge(&seeded.state.db, Utc::now() + Duration::hours(1), &files(&seeded))
        .await
        .expect("purge");

    assert_eq!(
        report,
        PurgeReport {
            sessions: 1,
            executions: 1,
            work_items: 1,
        }
    );

    let sessions = SessionRepo::new(Arc::clone(&seeded.state.db));
    assert!(sessions.get("old").await.expect("query").is_none());
    assert!(sessions.get("live").await.expect("query").is_some());

    let executions = ExecutionRepo::new(Arc::clone(&seeded.state.db));
    assert!(executions.list_for_session("old").await.expect("list").is_empty());
    assert_eq!(executions.list_for_session("live").await.expect("list").len(), 1);

    let work_items = WorkItemRepo::new(Arc::clone(&seeded.state.db));
    assert!(work_items.list_for_session("old").await.expect("list").is_empty());
    assert_eq!(work_items.list_for_session("live").await.expect("list").len(), 1);

    assert!(!old_dir.exists());
    assert!(live_dir.is_dir());
    assert!(!seeded.journal.path_for("old").exists());
    assert!(seeded.journal.path_for("live").exists());
}

#[tokio::test]
async fn recent_terminations_are_kept() {
    let seeded = seed().await;

    let cutoff = Utc::now() - Duration::days(30);
    let report = purge(&seeded.state.db, cutoff, &files(&seeded))
        .await
        .expect("purge");

    assert_eq!(report, PurgeReport::default());
    let sessions = SessionRepo::new(Arc::clone(&seeded.state.db));
    assert!(sessions.get("old").await.expect("query").is_some());
    assert!(seeded.state.sessions.storage("old").root.is_dir());
    assert!(seeded.journal.path_for("old").exists());
}

#[tokio::test]
async fn archived_items_of_live_sessions_age_out() {
    let seeded = seed().await;
    let work_items = WorkItemRepo::new(Arc::clone(&seeded.state.db));

    let finished = Utc::now() - Duration::days(40);
    let mut archived = WorkItem::new("live", verify_job());
    archived.status = WorkStatus::Completed;
    archived.started_at = Some(finished);
    archived.completed_at = Some(finished);
    archived.archived = true;
    work_items.enqueue(&archived).await.expect("archived item");

    let report = purge(&seeded.state.db, Utc::now() - Duration::days(30), &files(&seeded))
        .await
        .expect("purge");

    assert_eq!(report.work_items, 1);
    assert_eq!(report.sessions, 0);
    assert!(work_items
        .get_by_id(&archived.id)
        .await
        .expect("query")
        .is_none());
    assert_eq!(work_items.list_for_session("live").await.expect("list").len(), 1);
}
