//! Soft presence: who is in the room, and who is still around.
//!
//! The server never pushes an "offline" signal. A member is online while
//! their last-seen timestamp is within the presence window:
//!
//! ```text
//!   online  ⇔  now - last_seen_at ≤ window        (30 s by default)
//! ```
//!
//! ## Data flow
//!
//! ```text
//!  PresenceSnapshot ───────────────────────────┐ replace
//!                                              ▼
//!  PeerJoined / PeerLeft ─► refresh signal ─► refresher task
//!                             (coalesced)      │ GET participants
//!                                              ▼
//!                                   PresenceAggregator ─► current_members(now)
//! ```
//!
//! Join/leave events are triggers only; the member set is always replaced
//! wholesale from an authoritative snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::RoomApi;
use crate::bus::{EventBus, Subscription};
use crate::model::{Member, RoomEvent};

/// A member together with their derived online flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub member: Member,
    /// Seen within the presence window.
    pub online: bool,
}

/// Latest membership snapshot plus the online/stale rule.
#[derive(Debug, Clone)]
pub struct PresenceAggregator {
    /// Inclusive online window.
    window: TimeDelta,
    /// Latest snapshot, in server order.
    members: Vec<Member>,
}

impl PresenceAggregator {
    /// Create an empty aggregator with the given online window.
    pub fn new(window: Duration) -> Self {
        Self {
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX),
            members: Vec::new(),
        }
    }

    /// The online window.
    pub fn window(&self) -> TimeDelta {
        self.window
    }

    /// Replace the member set with `members`.
    ///
    /// Snapshot order is kept; a repeated user id keeps its first position
    /// and the later timestamp. For members already present, `last_seen_at`
    /// never moves backwards.
    pub fn replace(&mut self, members: Vec<Member>) {
        let previous: HashMap<&str, DateTime<Utc>> = self
            .members
            .iter()
            .map(|m| (m.user_id.as_str(), m.last_seen_at))
            .collect();

        let mut next: Vec<Member> = Vec::with_capacity(members.len());
        let mut index: HashMap<String, usize> = HashMap::with_capacity(members.len());
        for mut member in members {
            if let Some(&seen) = previous.get(member.user_id.as_str()) {
                member.last_seen_at = member.last_seen_at.max(seen);
            }
            match index.get(&member.user_id) {
                Some(&at) => {
                    let kept = &mut next[at];
                    kept.last_seen_at = kept.last_seen_at.max(member.last_seen_at);
                }
                None => {
                    index.insert(member.user_id.clone(), next.len());
                    next.push(member);
                }
            }
        }
        self.members = next;
    }

    /// Members of the latest snapshot.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Check if `member` was seen within the window before `now`.
    pub fn is_online(&self, member: &Member, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(member.last_seen_at) <= self.window
    }

    /// Members in snapshot order, each classified against `now`.
    pub fn current_members(&self, now: DateTime<Utc>) -> Vec<PresenceEntry> {
        self.members
            .iter()
            .map(|member| PresenceEntry {
                online: self.is_online(member, now),
                member: member.clone(),
            })
            .collect()
    }

    /// Number of members online at `now`.
    pub fn online_count(&self, now: DateTime<Utc>) -> usize {
        self.members.iter().filter(|m| self.is_online(m, now)).count()
    }

    /// Number of members, online or not.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Check if the room has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Forget all members.
    pub fn clear(&mut self) {
        self.members.clear();
    }
}

// ───────────────────────────────────────────────────────────────────
// Session-bound tracker
// ───────────────────────────────────────────────────────────────────

/// Keeps a [`PresenceAggregator`] current for one room.
///
/// Owns a refresher task that re-fetches participants on demand. Dropping
/// the tracker aborts the task.
pub struct PresenceTracker {
    room_id: String,
    /// Shared with the bus handler and the refresher task.
    aggregator: Arc<Mutex<PresenceAggregator>>,
    /// Wakes the refresher.
    refresh_tx: mpsc::UnboundedSender<()>,
    refresher: JoinHandle<()>,
}

impl PresenceTracker {
    /// Start tracking `room_id`. Must be called from within a tokio runtime.
    pub fn spawn(api: Arc<dyn RoomApi>, room_id: impl Into<String>, window: Duration) -> Self {
        let room_id = room_id.into();
        let aggregator = Arc::new(Mutex::new(PresenceAggregator::new(window)));
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let refresher = tokio::spawn(refresh_loop(
            api,
            room_id.clone(),
            aggregator.clone(),
            refresh_rx,
        ));
        Self {
            room_id,
            aggregator,
            refresh_tx,
            refresher,
        }
    }

    /// React to presence events on `bus`.
    pub fn attach(&self, bus: &EventBus) -> Subscription {
        let aggregator = self.aggregator.clone();
        let refresh_tx = self.refresh_tx.clone();
        bus.subscribe(move |event| match event {
            RoomEvent::PresenceSnapshot { members } => {
                lock(&aggregator).replace(members.clone());
            }
            RoomEvent::PeerJoined { .. } | RoomEvent::PeerLeft { .. } => {
                let _ = refresh_tx.send(());
            }
            _ => {}
        })
    }

    /// Ask for a fresh participants snapshot.
    pub fn request_refresh(&self) {
        if self.refresh_tx.send(()).is_err() {
            log::debug!("Presence refresher for room {} already stopped", self.room_id);
        }
    }

    /// Members classified against `now`.
    pub fn current_members(&self, now: DateTime<Utc>) -> Vec<PresenceEntry> {
        lock(&self.aggregator).current_members(now)
    }

    /// Number of members online at `now`.
    pub fn online_count(&self, now: DateTime<Utc>) -> usize {
        lock(&self.aggregator).online_count(now)
    }

    /// Number of members in the latest snapshot.
    pub fn member_count(&self) -> usize {
        lock(&self.aggregator).len()
    }

    /// Stop refreshing. Idempotent.
    pub fn stop(&self) {
        self.refresher.abort();
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}

async fn refresh_loop(
    api: Arc<dyn RoomApi>,
    room_id: String,
    aggregator: Arc<Mutex<PresenceAggregator>>,
    mut signals: mpsc::UnboundedReceiver<()>,
) {
    while signals.recv().await.is_some() {
        // One fetch answers every signal queued so far.
        while signals.try_recv().is_ok() {}

        match api.participants(&room_id).await {
            Ok(members) => {
                log::debug!("Presence refresh for room {room_id}: {} members", members.len());
                lock(&aggregator).replace(members);
            }
            Err(e) => log::warn!("Presence refresh for room {room_id} failed: {e}"),
        }
    }
}

fn lock(aggregator: &Mutex<PresenceAggregator>) -> MutexGuard<'_, PresenceAggregator> {
    aggregator.lock().unwrap_or_else(PoisonError::into_inner)
}
