use agent_overseer::models::event::{BroadcastEvent, EventType};
use agent_overseer::models::outcome::{Outcome, SignalKind};
use serde_json::json;

#[test]
fn event_serializes_type_and_fields() {
    let event = BroadcastEvent::new("s1", EventType::StepCompleted)
        .with("step_id", "deploy")
        .with("progress", 50);
    let value = serde_json::to_value(&event).expect("serialize");

    assert_eq!(value["session_id"], "s1");
    assert_eq!(value["type"], "step_completed");
    assert_eq!(value["fields"], json!({ "step_id": "deploy", "progress": 50 }));
    assert!(value["timestamp"].is_string());
}

#[test]
fn encoded_len_matches_serialized_size() {
    let event = BroadcastEvent::new("s1", EventType::Status).with("message", "compiling");
    let encoded = serde_json::to_vec(&event).expect("serialize");
    assert_eq!(event.encoded_len(), encoded.len());

    let bigger = event.clone().with("detail", "x".repeat(100));
    assert!(bigger.encoded_len() > event.encoded_len());
}

#[test]
fn event_round_trips_through_journal_format() {
    let line = r#"{"session_id":"s1","type":"item_reclaimed","fields":{"item_id":"w1"},"timestamp":"2026-01-01T00:00:00Z"}"#;
    let event: BroadcastEvent = serde_json::from_str(line).expect("deserialize");
    assert_eq!(event.event_type, EventType::ItemReclaimed);
    assert_eq!(event.fields["item_id"], "w1");
}

#[test]
fn signal_kind_wire_names() {
    assert_eq!(SignalKind::Ack.as_str(), "ack");
    assert_eq!(SignalKind::Progress.as_str(), "progress");
    assert_eq!(SignalKind::Done.as_str(), "done");
    assert_eq!(SignalKind::Error.as_str(), "error");
    assert_eq!(
        serde_json::to_value(SignalKind::Done).expect("serialize"),
        json!("done")
    );
}

#[test]
fn outcome_failure_detection() {
    assert!(Outcome::new(SignalKind::Error, json!({ "message": "boom" })).is_failure());
    assert!(Outcome::new(SignalKind::Done, json!({ "success": false })).is_failure());
    assert!(!Outcome::new(SignalKind::Done, json!({ "success": true })).is_failure());
    assert!(!Outcome::new(SignalKind::Ack, json!(null)).is_failure());
}
