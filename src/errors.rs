//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// Spawning, writing to, or terminating a worker process failed.
    Process(String),
    /// Worker process unreachable or unresponsive after all probe retries.
    Handshake(String),
    /// No completion signal observed within the allotted window.
    SignalTimeout(String),
    /// A pipeline step raised or returned a failing result.
    Step {
        /// Identifier of the failing step.
        step_id: String,
        /// Human-readable step name.
        step_name: String,
        /// Failure detail.
        message: String,
    },
    /// A lifecycle transition that the state machine does not allow.
    InvalidTransition(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// IPC communication failure.
    Ipc(String),
    /// Caller is not authorized to perform the requested action.
    Unauthorized(String),
    /// JSON encoding or decoding failure.
    Serialization(String),
}

impl AppError {
    /// Stable machine-checkable reason code for persisted and broadcast failures.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Db(_) => "storage_error",
            Self::Io(_) => "io_error",
            Self::Process(_) => "process_error",
            Self::Handshake(_) => "handshake_failure",
            Self::SignalTimeout(_) => "signal_timeout",
            Self::Step { .. } => "step_failure",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::NotFound(_) => "not_found",
            Self::Ipc(_) => "ipc_error",
            Self::Unauthorized(_) => "unauthorized",
            Self::Serialization(_) => "serialization_error",
        }
    }

    /// Whether a caller may retry the operation with a fresh wait or respawn.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SignalTimeout(_) | Self::Handshake(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::Handshake(msg) => write!(f, "handshake failed: {msg}"),
            Self::SignalTimeout(msg) => write!(f, "signal timeout: {msg}"),
            Self::Step {
                step_id,
                step_name,
                message,
            } => write!(f, "step {step_id} ({step_name}) failed: {message}"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::Serialization(msg) => write!(f, "serialization: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
