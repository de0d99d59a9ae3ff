//! Bounded per-session replay buffer.

use std::collections::VecDeque;

use crate::models::event::BroadcastEvent;

/// FIFO ring capped by event count and, optionally, serialized bytes.
#[derive(Debug)]
pub struct EventHistory {
    events: VecDeque<(BroadcastEvent, usize)>,
    limit: usize,
    max_bytes: usize,
    bytes: usize,
}

impl EventHistory {
    /// Empty history. `max_bytes == 0` disables the byte cap.
    #[must_use]
    pub fn new(limit: usize, max_bytes: usize) -> Self {
        Self {
            events: VecDeque::new(),
            limit: limit.max(1),
            max_bytes,
            bytes: 0,
        }
    }

    /// Append an event, evicting the oldest entries until both caps hold.
    ///
    /// The newest event is always kept, even if it alone exceeds the byte cap.
    /// Returns the number of evicted events.
    pub fn push(&mut self, event: BroadcastEvent) -> usize {
        let size = event.encoded_len();
        self.bytes += size;
        self.events.push_back((event, size));

        let mut evicted = 0;
        while self.events.len() > 1 && self.over_budget() {
            if let Some((_, old)) = self.events.pop_front() {
                self.bytes -= old;
                evicted += 1;
            }
        }
        evicted
    }

    fn over_budget(&self) -> bool {
        self.events.len() > self.limit || (self.max_bytes > 0 && self.bytes > self.max_bytes)
    }

    /// Events oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &BroadcastEvent> {
        self.events.iter().map(|(event, _)| event)
    }

    /// Number of retained events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Serialized bytes currently retained.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}
