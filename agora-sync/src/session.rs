//! Room sessions: one joined room with its supervisor, history and presence.
//!
//! ```text
//!  RoomSession::enter(room)
//!     │ 1. POST join            (failure: SyncError::Join, nothing connects)
//!     │ 2. RoomClient           (supervisor + EventBus)
//!     │ 3. attach HistoryMerger, PresenceTracker to the bus
//!     │ 4. connect, initial participants fetch
//!     ▼
//!  live session ── leave() / drop ──► teardown (transport released,
//!                                     reconnect timer cancelled,
//!                                     refresher aborted, handlers removed)
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};

use crate::api::RoomApi;
use crate::bus::Subscription;
use crate::client::RoomClient;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::history::HistoryMerger;
use crate::model::{ChatMessage, RoomEvent};
use crate::presence::{PresenceEntry, PresenceTracker};
use crate::supervisor::ConnectionState;

/// A joined room.
pub struct RoomSession {
    room_id: String,
    /// Peer id assigned by the join.
    peer_id: String,
    api: Arc<dyn RoomApi>,
    /// Connection supervisor; owns the event bus.
    client: RoomClient,
    history: HistoryMerger,
    presence: PresenceTracker,
    /// Bus handlers installed by this session.
    subscriptions: Vec<Subscription>,
    torn_down: bool,
}

impl RoomSession {
    /// Join `room_id` and start syncing it.
    pub async fn enter(
        config: &SyncConfig,
        api: Arc<dyn RoomApi>,
        room_id: impl Into<String>,
    ) -> Result<Self, SyncError> {
        let room_id = room_id.into();
        // Idle until connect(); dropped without dialing if the join fails.
        let client = RoomClient::new(config)?;

        let receipt = api.join(&room_id).await.map_err(|source| SyncError::Join {
            room_id: room_id.clone(),
            source,
        })?;
        log::info!("Joined room {room_id} as peer {:?}", receipt.peer_id);

        let history = HistoryMerger::new(api.clone(), config.history_page_limit);
        let presence = PresenceTracker::spawn(api.clone(), room_id.clone(), config.presence_window);
        let subscriptions = vec![history.attach(client.bus()), presence.attach(client.bus())];

        client.connect(room_id.clone());
        presence.request_refresh();

        Ok(Self {
            room_id,
            peer_id: receipt.peer_id,
            api,
            client,
            history,
            presence,
            subscriptions,
            torn_down: false,
        })
    }

    /// Room this session joined.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Peer id assigned by the join.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Register a handler for room events.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        self.client.subscribe(handler)
    }

    /// Room events as a channel, for consumers on another task.
    pub fn events(&self) -> (mpsc::UnboundedReceiver<RoomEvent>, Subscription) {
        self.client.bus().subscribe_channel()
    }

    /// Fire-and-forget; dropped unless the connection is open.
    pub fn send_chat(&self, text: impl Into<String>) {
        self.client.send_chat(text);
    }

    /// Fetch the newest history page and merge it with live traffic.
    pub async fn load_initial(&self) -> Result<Vec<ChatMessage>, SyncError> {
        self.history.load_initial(&self.room_id).await
    }

    /// Fetch the next older page; unchanged once history is exhausted.
    pub async fn load_older(&self) -> Result<Vec<ChatMessage>, SyncError> {
        self.history.load_older().await
    }

    /// Current merged chat sequence.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.history.messages()
    }

    /// Check whether older history remains.
    pub fn has_older(&self) -> bool {
        self.history.has_older()
    }

    /// Room members classified as online or stale at `now`.
    pub fn members(&self, now: DateTime<Utc>) -> Vec<PresenceEntry> {
        self.presence.current_members(now)
    }

    /// Number of members online at `now`.
    pub fn online_count(&self, now: DateTime<Utc>) -> usize {
        self.presence.online_count(now)
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.client.state()
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.client.state_changes()
    }

    /// Wait until the connection reaches `target`.
    pub async fn wait_for(&self, target: ConnectionState) -> bool {
        self.client.wait_for(target).await
    }

    /// Tear down, then tell the server we left. The leave call is
    /// best-effort: a failure is logged, not returned.
    pub async fn leave(mut self) {
        self.teardown();
        match self.api.leave(&self.room_id).await {
            Ok(()) => log::info!("Left room {}", self.room_id),
            Err(e) => log::warn!("Leaving room {} failed: {e}", self.room_id),
        }
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        self.client.disconnect();
        self.presence.stop();
        self.history.reset();
        log::debug!("Session for room {} torn down", self.room_id);
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Single-slot "current session" holder.
///
/// Entering a room first tears down and leaves whatever session occupies
/// the slot, so at most one session is live per registry.
pub struct SessionRegistry {
    config: SyncConfig,
    api: Arc<dyn RoomApi>,
    /// The live session, if any.
    current: Mutex<Option<RoomSession>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new(config: SyncConfig, api: Arc<dyn RoomApi>) -> Self {
        Self {
            config,
            api,
            current: Mutex::new(None),
        }
    }

    /// Replace the current session with one for `room_id`. On failure the
    /// slot is left empty.
    pub async fn enter(&self, room_id: impl Into<String>) -> Result<(), SyncError> {
        let mut slot = self.current.lock().await;
        if let Some(previous) = slot.take() {
            previous.leave().await;
        }
        let session = RoomSession::enter(&self.config, self.api.clone(), room_id).await?;
        *slot = Some(session);
        Ok(())
    }

    /// Leave the current session, if any. Returns whether one was active.
    pub async fn leave(&self) -> bool {
        let previous = self.current.lock().await.take();
        match previous {
            Some(session) => {
                session.leave().await;
                true
            }
            None => false,
        }
    }

    /// Room of the current session.
    pub async fn current_room(&self) -> Option<String> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|session| session.room_id.clone())
    }

    /// Lock the slot for direct access to the current session.
    pub async fn current(&self) -> MutexGuard<'_, Option<RoomSession>> {
        self.current.lock().await
    }
}
