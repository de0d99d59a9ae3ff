//! On-disk layout of per-session storage.
//!
//! ```text
//! <data_dir>/sessions/<session>/markers/<kind>.marker
//! <data_dir>/sessions/<session>/output/<artifact>
//! <data_dir>/journal/<session>.jsonl
//! ```

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::models::outcome::SignalKind;
use crate::Result;

/// Encode an externally supplied session id as a single path component.
///
/// Bytes outside `[A-Za-z0-9_-]` are percent-encoded, which keeps the
/// mapping injective and rules out `..` and separators.
#[must_use]
pub fn path_component(session_id: &str) -> String {
    let mut out = String::with_capacity(session_id.len());
    for byte in session_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    if out.is_empty() {
        out.push_str("%00");
    }
    out
}

/// Handle to a session's durable directory tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageHandle {
    /// Session identifier.
    pub session_id: String,
    /// Root of the session tree.
    pub root: PathBuf,
}

impl StorageHandle {
    /// Compute the handle for `session_id` under `sessions_dir` without touching disk.
    #[must_use]
    pub fn new(sessions_dir: &Path, session_id: &str) -> Self {
        Self {
            session_id: session_id.to_owned(),
            root: sessions_dir.join(path_component(session_id)),
        }
    }

    /// Directory holding sentinel marker files.
    #[must_use]
    pub fn markers_dir(&self) -> PathBuf {
        self.root.join("markers")
    }

    /// Directory the worker writes its output artifacts into.
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }

    /// Sentinel file for a signal kind.
    #[must_use]
    pub fn marker_path(&self, kind: SignalKind) -> PathBuf {
        self.markers_dir().join(format!("{}.marker", kind.as_str()))
    }

    /// Expected artifact path.
    #[must_use]
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.output_dir().join(name)
    }

    /// Create the directory tree. Existing content is left alone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if a directory cannot be created.
    pub async fn create_dirs(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.markers_dir()).await?;
        tokio::fs::create_dir_all(self.output_dir()).await?;
        Ok(())
    }
}
