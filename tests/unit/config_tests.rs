use agent_overseer::config::{GlobalConfig, ProcessBackend, SignalBackend};
use agent_overseer::AppError;

fn minimal_toml(data_dir: &str) -> String {
    format!("data_dir = '{data_dir}'\n")
}

fn with_section(data_dir: &str, section: &str) -> String {
    format!("{}\n{section}", minimal_toml(data_dir))
}

fn expect_config_error(raw: &str, needle: &str) {
    match GlobalConfig::from_toml_str(raw) {
        Err(AppError::Config(msg)) => {
            assert!(msg.contains(needle), "expected '{needle}' in '{msg}'");
        }
        other => panic!("expected config error containing '{needle}', got {other:?}"),
    }
}

#[test]
fn minimal_config_uses_defaults() {
    let config = GlobalConfig::from_toml_str(&minimal_toml("/tmp/overseer")).expect("valid");

    assert_eq!(config.http_port, 3000);
    assert_eq!(config.ipc_name, "agent-overseer");
    assert_eq!(config.retention_days, 30);
    assert_eq!(config.process.backend, ProcessBackend::Pty);
    assert_eq!(config.process.host_cli, "claude");
    assert_eq!(config.signal.backend, SignalBackend::ToolCall);
    assert_eq!(config.handshake.max_retries, 3);
    assert_eq!(config.handshake.max_age_days, 5);
    assert_eq!(config.queue.concurrency_limit, 1);
    assert_eq!(config.queue.stale_timeout_seconds, 1800);
    assert!(config.queue.autostart);
    assert!(config.broadcast.persist_history);
}

#[test]
fn derived_paths_live_under_data_dir() {
    let config = GlobalConfig::from_toml_str(&minimal_toml("/srv/overseer")).expect("valid");
    assert_eq!(config.db_path(), std::path::Path::new("/srv/overseer/overseer.db"));
    assert_eq!(config.sessions_dir(), std::path::Path::new("/srv/overseer/sessions"));
    assert_eq!(config.journal_dir(), std::path::Path::new("/srv/overseer/journal"));
    assert_eq!(config.templates_dir(), std::path::Path::new("/srv/overseer/templates"));
}

#[test]
fn full_config_parses_every_section() {
    let raw = r#"
data_dir = '/srv/overseer'
http_port = 8080
ipc_name = "overseer-test"
retention_days = 7

[process]
backend = "tmux"
host_cli = "codex"
host_cli_args = ["--quiet"]

[handshake]
max_retries = 5
retry_delay_ms = 250
probe_template = "printf '%s\n' {tag}"
max_age_days = 2

[signal]
backend = "artifact"
artifact_name = "answer.md"
min_artifact_bytes = 64

[queue]
concurrency_limit = 4
stale_timeout_seconds = 600
autostart = false

[broadcast]
history_limit = 50
persist_history = false
"#;
    let config = GlobalConfig::from_toml_str(raw).expect("valid");

    assert_eq!(config.http_port, 8080);
    assert_eq!(config.process.backend, ProcessBackend::Tmux);
    assert_eq!(config.process.host_cli_args, vec!["--quiet".to_owned()]);
    assert_eq!(config.handshake.max_retries, 5);
    assert_eq!(config.probe_retry_delay().as_millis(), 250);
    assert_eq!(config.max_process_age(), chrono::Duration::days(2));
    assert_eq!(config.signal.backend, SignalBackend::Artifact);
    assert_eq!(config.signal.min_artifact_bytes, 64);
    assert_eq!(config.queue.concurrency_limit, 4);
    assert_eq!(config.stale_timeout(), chrono::Duration::seconds(600));
    assert!(!config.queue.autostart);
    assert_eq!(config.broadcast.history_limit, 50);
}

#[test]
fn missing_data_dir_is_rejected() {
    assert!(matches!(
        GlobalConfig::from_toml_str("http_port = 3000\n"),
        Err(AppError::Config(_))
    ));
}

#[test]
fn empty_data_dir_is_rejected() {
    expect_config_error(&minimal_toml(""), "data_dir");
}

#[test]
fn zero_concurrency_is_rejected() {
    expect_config_error(
        &with_section("/tmp/o", "[queue]\nconcurrency_limit = 0\n"),
        "concurrency_limit",
    );
}

#[test]
fn zero_poll_interval_is_rejected() {
    expect_config_error(
        &with_section("/tmp/o", "[queue]\npoll_interval_seconds = 0\n"),
        "poll intervals",
    );
}

#[test]
fn probe_template_must_carry_tag() {
    expect_config_error(
        &with_section("/tmp/o", "[handshake]\nprobe_template = \"echo hello\"\n"),
        "{tag}",
    );
}

#[test]
fn zero_probe_retries_are_rejected() {
    expect_config_error(
        &with_section("/tmp/o", "[handshake]\nmax_retries = 0\n"),
        "max_retries",
    );
}

#[test]
fn blank_host_cli_is_rejected() {
    expect_config_error(
        &with_section("/tmp/o", "[process]\nhost_cli = \"  \"\n"),
        "host_cli",
    );
}

#[test]
fn zero_history_and_buffer_are_rejected() {
    expect_config_error(
        &with_section("/tmp/o", "[broadcast]\nhistory_limit = 0\n"),
        "history_limit",
    );
    expect_config_error(
        &with_section("/tmp/o", "[broadcast]\nobserver_buffer = 0\n"),
        "observer_buffer",
    );
}

#[test]
fn unknown_backend_is_rejected() {
    assert!(GlobalConfig::from_toml_str(&with_section(
        "/tmp/o",
        "[signal]\nbackend = \"carrier_pigeon\"\n"
    ))
    .is_err());
}

#[test]
fn load_from_path_reads_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, minimal_toml("/tmp/overseer")).expect("write");

    let config = GlobalConfig::load_from_path(&path).expect("load");
    assert_eq!(config.data_dir, std::path::Path::new("/tmp/overseer"));

    let missing = GlobalConfig::load_from_path(dir.path().join("absent.toml"));
    assert!(matches!(missing, Err(AppError::Config(_))));
}
