//! Append-only JSONL event journal, one file per session.
//!
//! The journal lets a restarted server rebuild each session's replay buffer
//! on the first connect. It is not a delivery guarantee.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::PathBuf;

use tracing::warn;

use crate::models::event::BroadcastEvent;
use crate::storage::path_component;
use crate::{AppError, Result};

/// Writes and reads `<dir>/<session>.jsonl`.
#[derive(Debug, Clone)]
pub struct EventJournal {
    dir: PathBuf,
}

impl EventJournal {
    /// Construct a journal stored in `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be created.
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|e| {
            AppError::Io(format!(
                "failed to create journal directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self { dir })
    }

    /// Journal file of a session.
    #[must_use]
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", path_component(session_id)))
    }

    /// Append one event as a JSON line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` or `AppError::Serialization` on failure.
    pub fn append(&self, event: &BroadcastEvent) -> Result<()> {
        let path = self.path_for(&event.session_id);
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// The last `limit` events of a session, oldest first.
    ///
    /// A missing file yields an empty list. Lines that fail to parse, such as
    /// a torn final write, are skipped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file exists but cannot be read.
    pub fn load(&self, session_id: &str, limit: usize) -> Result<Vec<BroadcastEvent>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let path = self.path_for(session_id);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut events = std::collections::VecDeque::with_capacity(limit.min(1024));
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BroadcastEvent>(&line) {
                Ok(event) => {
                    if events.len() == limit {
                        events.pop_front();
                    }
                    events.push_back(event);
                }
                Err(err) => {
                    warn!(session_id, line = index + 1, %err, "skipping malformed journal line");
                }
            }
        }
        Ok(events.into())
    }

    /// Delete a session's journal. A missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file exists but cannot be removed.
    pub fn remove(&self, session_id: &str) -> Result<()> {
        match fs::remove_file(self.path_for(session_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
