//! Bounded, ANSI-stripped capture of worker output.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Output read back from a process since some cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputChunk {
    /// Cleaned text.
    pub text: String,
    /// Cursor to pass to the next read.
    pub next_offset: u64,
    /// Part of the requested range was already evicted.
    pub truncated: bool,
}

struct Inner {
    text: String,
    /// Absolute offset of `text[0]`.
    start: u64,
    cap: usize,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    pending: Vec<u8>,
}

/// Shared ring of recent output; clones refer to the same buffer.
///
/// Offsets are absolute byte positions in the cleaned stream, so a reader
/// can ask for "everything after what I saw last" even after eviction.
#[derive(Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl OutputBuffer {
    /// Buffer retaining at most `cap` bytes of cleaned text.
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                text: String::new(),
                start: 0,
                cap: cap.max(1),
                pending: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append raw terminal bytes.
    pub fn push_bytes(&self, raw: &[u8]) {
        let clean = strip_ansi_escapes::strip(raw);
        let mut inner = self.lock();

        let mut bytes = std::mem::take(&mut inner.pending);
        bytes.extend_from_slice(&clean);

        match std::str::from_utf8(&bytes) {
            Ok(text) => inner.text.push_str(text),
            Err(err) if err.error_len().is_none() => {
                let (valid, rest) = bytes.split_at(err.valid_up_to());
                inner.text.push_str(&String::from_utf8_lossy(valid));
                inner.pending = rest.to_vec();
            }
            Err(_) => inner.text.push_str(&String::from_utf8_lossy(&bytes)),
        }

        if inner.text.len() > inner.cap {
            let mut cut = inner.text.len() - inner.cap;
            while !inner.text.is_char_boundary(cut) {
                cut += 1;
            }
            inner.text.drain(..cut);
            inner.start += cut as u64;
        }
    }

    /// Absolute offset one past the newest byte.
    #[must_use]
    pub fn end_offset(&self) -> u64 {
        let inner = self.lock();
        inner.start + inner.text.len() as u64
    }

    /// Everything written after `since`.
    #[must_use]
    pub fn read_since(&self, since: u64) -> OutputChunk {
        let inner = self.lock();
        let end = inner.start + inner.text.len() as u64;
        if since >= end {
            return OutputChunk {
                text: String::new(),
                next_offset: end,
                truncated: false,
            };
        }

        let truncated = since < inner.start;
        let mut index = usize::try_from(since.saturating_sub(inner.start)).unwrap_or(0);
        while !inner.text.is_char_boundary(index) {
            index += 1;
        }
        OutputChunk {
            text: inner.text[index..].to_owned(),
            next_offset: end,
            truncated,
        }
    }

    /// The newest `max_bytes` of retained text.
    #[must_use]
    pub fn tail(&self, max_bytes: usize) -> String {
        let inner = self.lock();
        let mut cut = inner.text.len().saturating_sub(max_bytes);
        while !inner.text.is_char_boundary(cut) {
            cut += 1;
        }
        inner.text[cut..].to_owned()
    }
}
