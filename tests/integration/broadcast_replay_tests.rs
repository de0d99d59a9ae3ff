//! Broadcast hub: replay-then-live ordering, slow observers, and journal
//! rehydration after a restart.

use agent_overseer::broadcast::journal::EventJournal;
use agent_overseer::broadcast::BroadcastHub;
use agent_overseer::config::BroadcastConfig;
use agent_overseer::models::event::{BroadcastEvent, EventType};

fn status(session: &str, n: u64) -> BroadcastEvent {
    BroadcastEvent::new(session, EventType::Status).with("n", n)
}

fn seq(event: &BroadcastEvent) -> u64 {
    event.fields["n"].as_u64().expect("numbered event")
}

fn config(history_limit: usize, observer_buffer: usize) -> BroadcastConfig {
    BroadcastConfig {
        history_limit,
        history_max_bytes: 0,
        persist_history: true,
        observer_buffer,
    }
}

#[tokio::test]
async fn late_observer_gets_history_then_live_events() {
    let hub = BroadcastHub::new(config(100, 16), None);
    for n in 0..3 {
        hub.broadcast(status("s1", n));
    }

    let mut observer = hub.connect("s1");
    hub.broadcast(status("s1", 3));

    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(seq(&observer.recv().await.expect("event")));
    }
    assert_eq!(received, vec![0, 1, 2, 3]);
    assert!(observer.try_recv().is_none(), "nothing duplicated");
}

#[tokio::test]
async fn sessions_do_not_leak_into_each_other() {
    let hub = BroadcastHub::new(config(100, 16), None);
    let mut alpha = hub.connect("alpha");

    hub.broadcast(status("beta", 1));
    let delivered = hub.broadcast(status("alpha", 2));

    assert_eq!(delivered, 1);
    assert_eq!(seq(&alpha.recv().await.expect("event")), 2);
    assert!(alpha.try_recv().is_none());
}

#[tokio::test]
async fn full_observer_is_dropped_without_blocking_others() {
    let hub = BroadcastHub::new(config(100, 2), None);
    let mut fast = hub.connect("s1");
    let _slow = hub.connect("s1");
    assert_eq!(hub.observer_count("s1"), 2);

    for n in 0..3 {
        hub.broadcast(status("s1", n));
        // The fast observer drains as it goes; the slow one never reads.
        assert_eq!(seq(&fast.recv().await.expect("event")), n);
    }

    assert_eq!(hub.observer_count("s1"), 1);
    let delivered = hub.broadcast(status("s1", 3));
    assert_eq!(delivered, 1);
}

#[tokio::test]
async fn disconnect_removes_the_observer() {
    let hub = BroadcastHub::new(config(100, 4), None);
    let observer = hub.connect("s1");

    hub.disconnect(observer);

    assert_eq!(hub.observer_count("s1"), 0);
    assert_eq!(hub.broadcast(status("s1", 0)), 0);
}

#[tokio::test]
async fn history_is_bounded() {
    let hub = BroadcastHub::new(config(5, 16), None);
    for n in 0..12 {
        hub.broadcast(status("s1", n));
    }

    let history: Vec<u64> = hub.history("s1").iter().map(seq).collect();
    assert_eq!(history, vec![7, 8, 9, 10, 11]);
}

#[tokio::test]
async fn restarted_hub_rehydrates_from_journal() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let journal = EventJournal::new(dir.path().to_path_buf()).expect("journal");
        let hub = BroadcastHub::new(config(3, 16), Some(journal));
        for n in 0..5 {
            hub.broadcast(status("s1", n));
        }
    }

    let journal = EventJournal::new(dir.path().to_path_buf()).expect("journal");
    let hub = BroadcastHub::new(config(3, 16), Some(journal));
    let mut observer = hub.connect("s1");

    let mut replayed = Vec::new();
    while let Some(event) = observer.try_recv() {
        replayed.push(seq(&event));
    }
    assert_eq!(replayed, vec![2, 3, 4]);
}

#[tokio::test]
async fn forget_drops_history_and_journal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let journal = EventJournal::new(dir.path().to_path_buf()).expect("journal");
    let path = journal.path_for("s1");
    let hub = BroadcastHub::new(config(10, 16), Some(journal));
    hub.broadcast(status("s1", 0));
    assert!(path.exists());

    hub.forget("s1");

    assert!(!path.exists());
    assert!(hub.history("s1").is_empty());
}
