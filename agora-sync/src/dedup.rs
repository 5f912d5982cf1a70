//! Duplicate suppression for live events.
//!
//! The transport is at-least-once: a frame can arrive twice on one
//! connection. Only events with a stable identity (chat messages, keyed by
//! message id) are tracked; presence and lifecycle events always pass.
//!
//! The window is scoped to one transport connection. The supervisor calls
//! [`EventDeduplicator::reset`] on every dial, because the server replays
//! recent messages after a reconnect and the history merge collapses those
//! at a higher level.

use std::collections::HashSet;

use crate::model::RoomEvent;

/// Chat ids seen on the current connection.
#[derive(Debug, Default)]
pub struct EventDeduplicator {
    seen: HashSet<String>,
}

impl EventDeduplicator {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `event` should propagate. Records its identity on first sight.
    pub fn admit(&mut self, event: &RoomEvent) -> bool {
        match event.identity() {
            Some(id) => self.seen.insert(id.to_owned()),
            None => true,
        }
    }

    /// Start a fresh window.
    pub fn reset(&mut self) {
        self.seen.clear();
    }

    /// Number of identities currently tracked.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Check if nothing has been admitted since the last reset.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
