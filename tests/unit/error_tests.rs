use agent_overseer::AppError;

#[test]
fn display_carries_category_prefix() {
    assert_eq!(
        AppError::NotFound("session s1".into()).to_string(),
        "not found: session s1"
    );
    assert_eq!(AppError::Config("bad port".into()).to_string(), "config: bad port");
    assert!(AppError::Handshake("no echo".into())
        .to_string()
        .starts_with("handshake failed"));
}

#[test]
fn step_error_names_the_step() {
    let err = AppError::Step {
        step_id: "deploy".into(),
        step_name: "Deploy".into(),
        message: "upload rejected".into(),
    };
    assert_eq!(err.to_string(), "step deploy (Deploy) failed: upload rejected");
    assert_eq!(err.reason(), "step_failure");
}

#[test]
fn reason_codes_are_stable() {
    let cases = [
        (AppError::Config(String::new()), "config_error"),
        (AppError::Db(String::new()), "storage_error"),
        (AppError::Io(String::new()), "io_error"),
        (AppError::Process(String::new()), "process_error"),
        (AppError::Handshake(String::new()), "handshake_failure"),
        (AppError::SignalTimeout(String::new()), "signal_timeout"),
        (AppError::InvalidTransition(String::new()), "invalid_transition"),
        (AppError::NotFound(String::new()), "not_found"),
        (AppError::Ipc(String::new()), "ipc_error"),
        (AppError::Unauthorized(String::new()), "unauthorized"),
        (AppError::Serialization(String::new()), "serialization_error"),
    ];
    for (err, reason) in cases {
        assert_eq!(err.reason(), reason, "{err:?}");
    }
}

#[test]
fn only_timeouts_and_handshakes_are_retryable() {
    assert!(AppError::SignalTimeout("ack".into()).is_retryable());
    assert!(AppError::Handshake("probe".into()).is_retryable());
    assert!(!AppError::Db("locked".into()).is_retryable());
    assert!(!AppError::NotFound("s1".into()).is_retryable());
}

#[test]
fn conversions_pick_the_right_variant() {
    let io: AppError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
    assert!(matches!(io, AppError::Io(_)));

    let json: AppError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
    assert!(matches!(json, AppError::Serialization(_)));

    let toml: AppError = toml::from_str::<toml::Value>("= nope").unwrap_err().into();
    assert!(matches!(toml, AppError::Config(_)));
}

#[test]
fn messages_have_no_trailing_period() {
    let err = AppError::Process("host cli not found".into());
    assert!(!err.to_string().ends_with('.'));
}
