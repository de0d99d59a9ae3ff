use agent_overseer::broadcast::history::EventHistory;
use agent_overseer::models::event::{BroadcastEvent, EventType};

fn numbered(n: u64) -> BroadcastEvent {
    BroadcastEvent::new("s1", EventType::Progress).with("n", n)
}

fn numbers(history: &EventHistory) -> Vec<u64> {
    history
        .iter()
        .map(|e| e.fields["n"].as_u64().expect("n"))
        .collect()
}

#[test]
fn count_cap_evicts_oldest_first() {
    let mut history = EventHistory::new(3, 0);
    let mut evicted = 0;
    for n in 0..5 {
        evicted += history.push(numbered(n));
    }

    assert_eq!(evicted, 2);
    assert_eq!(history.len(), 3);
    assert_eq!(numbers(&history), vec![2, 3, 4]);
}

#[test]
fn byte_cap_is_enforced() {
    let one = numbered(0).encoded_len();
    let mut history = EventHistory::new(100, one * 2 + one / 2);
    for n in 0..6 {
        history.push(numbered(n));
    }

    assert_eq!(history.len(), 2);
    assert!(history.bytes() <= one * 2 + one / 2);
    assert_eq!(numbers(&history), vec![4, 5]);
}

#[test]
fn oversized_newest_event_is_still_kept() {
    let mut history = EventHistory::new(10, 16);
    history.push(numbered(0));
    let evicted = history.push(numbered(1).with("blob", "x".repeat(200)));

    assert_eq!(evicted, 1);
    assert_eq!(history.len(), 1);
    assert_eq!(numbers(&history), vec![1]);
}

#[test]
fn bytes_track_retained_events() {
    let mut history = EventHistory::new(2, 0);
    assert!(history.is_empty());
    assert_eq!(history.bytes(), 0);

    let a = numbered(1);
    let b = numbered(2);
    let expected = a.encoded_len() + b.encoded_len();
    history.push(a);
    history.push(b);
    assert_eq!(history.bytes(), expected);
}
