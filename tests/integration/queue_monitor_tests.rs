//! Queue monitor: bounded dispatch, stale reclamation, and operator reclaim.

use std::sync::{Arc, Mutex};

use agent_overseer::broadcast::BroadcastHub;
use agent_overseer::config::BroadcastConfig;
use agent_overseer::models::event::EventType;
use agent_overseer::models::work_item::{
    JobPayload, WorkItem, WorkStatus, REASON_RECLAIMED, REASON_STALE_WORK,
};
use agent_overseer::orchestrator::queue_monitor::{JobDispatcher, QueueMonitor};
use agent_overseer::persistence::db::{self, Database};
use agent_overseer::persistence::work_item_repo::WorkItemRepo;
use agent_overseer::process::BoxFuture;
use agent_overseer::AppError;
use chrono::Utc;
use rand::Rng;

use super::test_helpers::test_config;

/// Dispatcher that records items and leaves them running.
#[derive(Default)]
struct RecordingDispatcher {
    seen: Mutex<Vec<String>>,
}

impl JobDispatcher for RecordingDispatcher {
    fn dispatch(&self, item: WorkItem) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.seen.lock().unwrap().push(item.id);
        })
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    db: Arc<Database>,
    hub: Arc<BroadcastHub>,
    monitor: QueueMonitor,
}

async fn fixture(limit: u32) -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.queue.concurrency_limit = limit;
    let db = Arc::new(db::connect_memory().await.expect("db"));
    let hub = Arc::new(BroadcastHub::new(BroadcastConfig::default(), None));
    let monitor = QueueMonitor::new(
        Arc::clone(&db),
        &config,
        Arc::new(RecordingDispatcher::default()),
        Arc::clone(&hub),
    );
    Fixture {
        _dir: dir,
        db,
        hub,
        monitor,
    }
}

fn verify_job() -> JobPayload {
    JobPayload::Verify {
        url: "https://app.example.test".into(),
    }
}

async fn status_of(db: &Arc<Database>, id: &str) -> WorkStatus {
    WorkItemRepo::new(Arc::clone(db))
        .get_by_id(id)
        .await
        .expect("query")
        .expect("item exists")
        .status
}

#[tokio::test]
async fn dispatch_respects_the_concurrency_limit() {
    let fx = fixture(1).await;
    let first = fx.monitor.enqueue("alpha", verify_job()).await.expect("enqueue");
    let second = fx.monitor.enqueue("alpha", verify_job()).await.expect("enqueue");

    let claimed = fx.monitor.run_dispatch_cycle().await.expect("cycle");

    assert_eq!(claimed, 1);
    assert_eq!(status_of(&fx.db, &first.id).await, WorkStatus::Running);
    assert_eq!(status_of(&fx.db, &second.id).await, WorkStatus::Pending);
    assert_eq!(fx.monitor.available_slots("alpha").await.expect("slots"), 0);

    let usage = fx.monitor.slot_usage().await.expect("usage");
    assert_eq!(usage.len(), 1);
    assert_eq!((usage[0].running, usage[0].pending), (1, 1));

    let again = fx.monitor.run_dispatch_cycle().await.expect("cycle");
    assert_eq!(again, 0, "a full session gets no further claims");
}

#[tokio::test]
async fn sessions_have_independent_slots() {
    let fx = fixture(1).await;
    fx.monitor.enqueue("alpha", verify_job()).await.expect("enqueue");
    fx.monitor.enqueue("beta", verify_job()).await.expect("enqueue");

    let claimed = fx.monitor.run_dispatch_cycle().await.expect("cycle");

    assert_eq!(claimed, 2);
}

#[tokio::test]
async fn stale_item_is_reclaimed_and_frees_its_slot() {
    let fx = fixture(1).await;
    let repo = WorkItemRepo::new(Arc::clone(&fx.db));
    let stuck = WorkItem {
        status: WorkStatus::Running,
        started_at: Some(Utc::now() - chrono::Duration::minutes(31)),
        ..WorkItem::new("alpha", verify_job())
    };
    repo.enqueue(&stuck).await.expect("insert running item");
    let waiting = fx.monitor.enqueue("alpha", verify_job()).await.expect("enqueue");
    assert_eq!(fx.monitor.run_dispatch_cycle().await.expect("cycle"), 0);

    let reclaimed = fx.monitor.run_stale_scan().await.expect("scan");

    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, stuck.id);
    let stored = repo.get_by_id(&stuck.id).await.expect("query").expect("item");
    assert_eq!(stored.status, WorkStatus::Failed);
    assert!(stored.error.as_deref().unwrap_or("").contains("stale"));
    assert_eq!(stored.error_reason.as_deref(), Some(REASON_STALE_WORK));

    let events = fx.hub.history("alpha");
    let event = events
        .iter()
        .find(|e| e.event_type == EventType::ItemReclaimed)
        .expect("reclaim event");
    assert_eq!(event.fields["item_id"], stuck.id.as_str());
    let error = events
        .iter()
        .find(|e| e.event_type == EventType::Error)
        .expect("error event");
    assert_eq!(error.fields["item_id"], stuck.id.as_str());
    assert_eq!(error.fields["reason"], REASON_STALE_WORK);
    assert_eq!(error.fields["message"], stored.error.as_deref().unwrap_or_default());

    assert_eq!(fx.monitor.run_dispatch_cycle().await.expect("cycle"), 1);
    assert_eq!(status_of(&fx.db, &waiting.id).await, WorkStatus::Running);
}

#[tokio::test]
async fn recent_running_item_is_not_stale() {
    let fx = fixture(1).await;
    let item = fx.monitor.enqueue("alpha", verify_job()).await.expect("enqueue");
    fx.monitor.run_dispatch_cycle().await.expect("cycle");

    let reclaimed = fx.monitor.run_stale_scan().await.expect("scan");

    assert!(reclaimed.is_empty());
    assert_eq!(status_of(&fx.db, &item.id).await, WorkStatus::Running);
}

#[tokio::test]
async fn force_reclaim_only_applies_to_running_items() {
    let fx = fixture(1).await;
    let running = fx.monitor.enqueue("alpha", verify_job()).await.expect("enqueue");
    let pending = fx.monitor.enqueue("alpha", verify_job()).await.expect("enqueue");
    fx.monitor.run_dispatch_cycle().await.expect("cycle");

    let missing = fx.monitor.force_reclaim("no-such-item").await;
    assert!(matches!(missing, Err(AppError::NotFound(_))));

    let not_running = fx.monitor.force_reclaim(&pending.id).await;
    assert!(matches!(not_running, Err(AppError::InvalidTransition(_))));

    let reclaimed = fx.monitor.force_reclaim(&running.id).await.expect("reclaim");
    assert_eq!(reclaimed.status, WorkStatus::Failed);
    assert_eq!(reclaimed.error.as_deref(), Some("reclaimed by operator"));
    assert_eq!(reclaimed.error_reason.as_deref(), Some(REASON_RECLAIMED));
}

#[tokio::test]
async fn enqueue_rejects_payloads_that_cannot_run() {
    let fx = fixture(1).await;

    let result = fx
        .monitor
        .enqueue(
            "alpha",
            JobPayload::Prompt {
                template_id: "  ".into(),
                variables: std::collections::BTreeMap::new(),
            },
        )
        .await;

    assert!(matches!(result, Err(AppError::Config(_))));
    assert!(fx.monitor.slot_usage().await.expect("usage").is_empty());
}

#[tokio::test]
async fn running_count_never_exceeds_limit_for_random_queues() {
    let mut rng = rand::thread_rng();

    for _ in 0..8 {
        let limit = rng.gen_range(1..=3);
        let fx = fixture(limit).await;
        let sessions = rng.gen_range(1..=4);
        let mut queued = Vec::new();
        for index in 0..sessions {
            let session = format!("session-{index}");
            let count: u32 = rng.gen_range(0..=6);
            for _ in 0..count {
                fx.monitor.enqueue(&session, verify_job()).await.expect("enqueue");
            }
            queued.push((session, count));
        }

        for _ in 0..rng.gen_range(1..=3) {
            fx.monitor.run_dispatch_cycle().await.expect("cycle");
        }

        let repo = WorkItemRepo::new(Arc::clone(&fx.db));
        for (session, count) in queued {
            let running = repo.running_count(&session).await.expect("count");
            assert_eq!(
                running,
                count.min(limit),
                "session {session}: {count} queued, limit {limit}"
            );
        }
    }
}
