use std::path::Path;

use agent_overseer::models::outcome::SignalKind;
use agent_overseer::storage::{path_component, StorageHandle};

#[test]
fn safe_ids_pass_through() {
    assert_eq!(path_component("session-1_A"), "session-1_A");
}

#[test]
fn separators_and_dots_are_encoded() {
    assert_eq!(path_component("../etc"), "%2E%2E%2Fetc");
    assert_eq!(path_component("a/b\\c"), "a%2Fb%5Cc");
    assert_eq!(path_component("a.b"), "a%2Eb");
}

#[test]
fn encoding_is_injective_for_percent_signs() {
    assert_ne!(path_component("a%2F"), path_component("a/"));
    assert_eq!(path_component("a%"), "a%25");
}

#[test]
fn empty_id_gets_a_placeholder() {
    assert_eq!(path_component(""), "%00");
}

#[test]
fn non_ascii_is_encoded_bytewise() {
    assert_eq!(path_component("é"), "%C3%A9");
}

#[test]
fn handle_layout() {
    let handle = StorageHandle::new(Path::new("/data/sessions"), "s 1");
    assert_eq!(handle.root, Path::new("/data/sessions/s%201"));
    assert_eq!(handle.markers_dir(), Path::new("/data/sessions/s%201/markers"));
    assert_eq!(
        handle.marker_path(SignalKind::Done),
        Path::new("/data/sessions/s%201/markers/done.marker")
    );
    assert_eq!(
        handle.artifact_path("result.md"),
        Path::new("/data/sessions/s%201/output/result.md")
    );
}

#[tokio::test]
async fn create_dirs_keeps_existing_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = StorageHandle::new(dir.path(), "s1");
    handle.create_dirs().await.expect("create");
    std::fs::write(handle.artifact_path("keep.md"), "x").expect("write");

    handle.create_dirs().await.expect("create again");
    assert!(handle.artifact_path("keep.md").exists());
}
