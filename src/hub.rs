//! ==============================================================================
//! hub.rs - live fan-out of probe events
//! ==============================================================================
//!
//! purpose:
//!     owns the history buffer and the broadcast channel that every connected
//!     dashboard listens on. the poll loop records readings here; websocket
//!     handlers connect here.
//!
//! ordering:
//!     recording a reading (append + send) and connecting a client
//!     (subscribe + snapshot) take the same lock. a reading is therefore
//!     either in the client's replay or delivered live, never both and never
//!     neither.
//!
//! relationships:
//!     - used by: session.rs (record / publish)
//!     - used by: server.rs (connect / snapshot)
//!
//! ==============================================================================

use crate::domain::{ProbeEvent, Reading, TemperatureUpdate};
use crate::history::HistoryBuffer;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

/// events a slow client may fall behind by before it starts losing them
const CHANNEL_DEPTH: usize = 64;

pub struct LiveHub {
    history: Mutex<HistoryBuffer>,
    tx: broadcast::Sender<ProbeEvent>,
}

/// what a new client gets: the replay, then the live stream
pub struct Subscription {
    pub history: Vec<Reading>,
    pub events: broadcast::Receiver<ProbeEvent>,
}

impl LiveHub {
    pub fn new(history_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_DEPTH);
        Self { history: Mutex::new(HistoryBuffer::new(history_capacity)), tx }
    }

    /// append a reading to history and push it to every client
    pub fn record(&self, reading: Reading) {
        let mut history = self.history();
        let update = TemperatureUpdate::reading(&reading);
        history.append(reading);
        self.publish(ProbeEvent::TemperatureUpdate(update));
    }

    /// best effort; never blocks, and having no clients is not an error
    pub fn publish(&self, event: ProbeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn connect(&self) -> Subscription {
        let history = self.history();
        if history.is_empty() {
            debug!("new client, nothing recorded yet");
        }
        let events = self.tx.subscribe();
        Subscription { history: history.snapshot(), events }
    }

    pub fn snapshot(&self) -> Vec<Reading> {
        self.history().snapshot()
    }

    pub fn history_len(&self) -> usize {
        self.history().len()
    }

    pub fn history_capacity(&self) -> usize {
        self.history().capacity()
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn history(&self) -> MutexGuard<'_, HistoryBuffer> {
        // a panicked writer leaves a consistent deque behind
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
