//! Per-session fan-out of events to live observers, with replay.
//!
//! Each session owns a bounded history and a set of observers. Connecting
//! replays the history into the new observer's channel and registers it
//! under the same lock that `broadcast` takes, so an observer sees history
//! in order followed by live events only, with nothing interleaved or
//! duplicated. Delivery uses `try_send`; an observer whose channel is full
//! or closed is marked dead and removed after the pass, never blocking the
//! others.

pub mod history;
pub mod journal;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::BroadcastConfig;
use crate::models::event::BroadcastEvent;

use self::history::EventHistory;
use self::journal::EventJournal;

struct Observer {
    id: u64,
    tx: mpsc::Sender<BroadcastEvent>,
}

struct SessionChannel {
    history: EventHistory,
    observers: Vec<Observer>,
}

/// Receiving end handed to one observer.
#[derive(Debug)]
pub struct ObserverHandle {
    id: u64,
    session_id: String,
    rx: mpsc::Receiver<BroadcastEvent>,
}

impl ObserverHandle {
    /// Observer identifier, unique within the hub.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Session this observer follows.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next event; `None` once the hub dropped this observer.
    pub async fn recv(&mut self) -> Option<BroadcastEvent> {
        self.rx.recv().await
    }

    /// Next already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<BroadcastEvent> {
        self.rx.try_recv().ok()
    }
}

/// Fan-out hub shared by the orchestrator, the push endpoint, and subscribers.
pub struct BroadcastHub {
    config: BroadcastConfig,
    journal: Option<EventJournal>,
    channels: Mutex<HashMap<String, SessionChannel>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    /// Create a hub. Pass a journal to persist and rehydrate history.
    #[must_use]
    pub fn new(config: BroadcastConfig, journal: Option<EventJournal>) -> Self {
        Self {
            config,
            journal,
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionChannel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channel<'a>(
        &self,
        channels: &'a mut HashMap<String, SessionChannel>,
        session_id: &str,
    ) -> &'a mut SessionChannel {
        channels.entry(session_id.to_owned()).or_insert_with(|| {
            let mut history =
                EventHistory::new(self.config.history_limit, self.config.history_max_bytes);
            if let Some(journal) = &self.journal {
                match journal.load(session_id, self.config.history_limit) {
                    Ok(events) => {
                        if !events.is_empty() {
                            debug!(session_id, count = events.len(), "history rehydrated");
                        }
                        for event in events {
                            history.push(event);
                        }
                    }
                    Err(err) => warn!(session_id, %err, "journal replay failed"),
                }
            }
            SessionChannel {
                history,
                observers: Vec::new(),
            }
        })
    }

    /// Register an observer and queue the session history for it.
    #[must_use]
    pub fn connect(&self, session_id: &str) -> ObserverHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut channels = self.lock();
        let channel = self.channel(&mut channels, session_id);

        let (tx, rx) = mpsc::channel(channel.history.len() + self.config.observer_buffer);
        for event in channel.history.iter() {
            // Capacity covers the whole history.
            let _ = tx.try_send(event.clone());
        }
        channel.observers.push(Observer { id, tx });

        debug!(
            session_id,
            observer_id = id,
            replayed = channel.history.len(),
            "observer connected"
        );

        ObserverHandle {
            id,
            session_id: session_id.to_owned(),
            rx,
        }
    }

    /// Remove an observer.
    pub fn disconnect(&self, handle: ObserverHandle) {
        let mut channels = self.lock();
        if let Some(channel) = channels.get_mut(&handle.session_id) {
            channel.observers.retain(|observer| observer.id != handle.id);
        }
        debug!(
            session_id = %handle.session_id,
            observer_id = handle.id,
            "observer disconnected"
        );
    }

    /// Record an event and deliver it to every live observer of its session.
    ///
    /// Returns the number of observers that accepted the event.
    pub fn broadcast(&self, event: BroadcastEvent) -> usize {
        let session_id = event.session_id.clone();
        let mut channels = self.lock();
        let channel = self.channel(&mut channels, &session_id);

        if self.config.persist_history {
            if let Some(journal) = &self.journal {
                if let Err(err) = journal.append(&event) {
                    warn!(session_id = %session_id, %err, "journal append failed");
                }
            }
        }

        let mut delivered = 0;
        let mut dead = Vec::new();
        for observer in &channel.observers {
            match observer.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    let reason = match err {
                        mpsc::error::TrySendError::Full(_) => "full",
                        mpsc::error::TrySendError::Closed(_) => "closed",
                    };
                    warn!(
                        session_id = %session_id,
                        observer_id = observer.id,
                        reason,
                        "observer delivery failed, dropping observer"
                    );
                    dead.push(observer.id);
                }
            }
        }

        if !dead.is_empty() {
            channel.observers.retain(|observer| !dead.contains(&observer.id));
        }
        channel.history.push(event);

        delivered
    }

    /// Number of registered observers for a session.
    #[must_use]
    pub fn observer_count(&self, session_id: &str) -> usize {
        self.lock()
            .get(session_id)
            .map_or(0, |channel| channel.observers.len())
    }

    /// Snapshot of a session's history, oldest first.
    #[must_use]
    pub fn history(&self, session_id: &str) -> Vec<BroadcastEvent> {
        let mut channels = self.lock();
        let events = self
            .channel(&mut channels, session_id)
            .history
            .iter()
            .cloned()
            .collect();
        events
    }

    /// Drop the in-memory state of a session and its journal file.
    pub fn forget(&self, session_id: &str) {
        self.lock().remove(session_id);
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.remove(session_id) {
                warn!(session_id, %err, "journal removal failed");
            }
        }
    }
}
