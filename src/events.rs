//! Broadcast of engine activity.
//!
//! The engine emits via [`EventBus::emit`]; observers (the binary's logger,
//! tests) subscribe via [`EventBus::subscribe`]. Built on
//! [`tokio::sync::broadcast`] so multiple listeners can react independently.

use tokio::sync::broadcast;

use crate::store::PollId;

/// Things the engine did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A poll was stored and its first render posted.
    PollCreated { poll_id: PollId, location_id: String },
    VoteRecorded {
        poll_id: PollId,
        voter: String,
        option: usize,
    },
    /// The rendered tally of a poll was edited in place.
    PollEdited { poll_id: PollId },
    /// The channel refused us in a community; no further edits go there.
    CommunityBanned { community: String },
}

/// A broadcast channel that any component can emit to or subscribe from.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all current subscribers.
    /// Returns the number of receivers that will see it.
    pub fn emit(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events. Returns a receiver that yields all
    /// future events (does not replay past ones).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
