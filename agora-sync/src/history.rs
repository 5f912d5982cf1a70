//! Merged chat history: paginated REST pages plus the live feed.
//!
//! ```text
//!   REST pages (newest page first)          live ChatMessage events
//!   load_initial / load_older                 (EventBus handler)
//!             │  merge_newest / merge_page         │ push_live
//!             ▼                                    ▼
//!        ┌──────────────────────────────────────────────┐
//!        │ ChatTimeline: ascending created_at, one      │
//!        │ entry per id, ties kept in arrival order     │
//!        └──────────────────────────────────────────────┘
//! ```
//!
//! [`ChatTimeline`] is the pure merge structure. [`HistoryMerger`] drives it
//! from the [`RoomApi`] and the bus. The timeline lock is never held across
//! a REST call; a page that arrives after the merger was reset is dropped.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::api::{HistoryPage, HistoryQuery, RoomApi};
use crate::bus::{EventBus, Subscription};
use crate::error::SyncError;
use crate::model::{ChatMessage, RoomEvent};

/// Pagination position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Cursor {
    /// No page fetched yet.
    #[default]
    Unloaded,
    /// Older messages are available from this cursor.
    More(String),
    /// The oldest page has been fetched.
    Exhausted,
}

impl Cursor {
    /// Cursor following a page whose `next_cursor` was `next`.
    fn from_next(next: Option<String>) -> Self {
        match next {
            Some(cursor) if !cursor.is_empty() => Cursor::More(cursor),
            _ => Cursor::Exhausted,
        }
    }
}

/// Ordered, duplicate-free chat sequence.
#[derive(Debug, Default)]
pub struct ChatTimeline {
    /// Ascending by `created_at`.
    messages: Vec<ChatMessage>,
    /// Every id in `messages`.
    ids: HashSet<String>,
    cursor: Cursor,
}

impl ChatTimeline {
    /// Create an empty, unloaded timeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an older page and adopt its cursor. Returns how many messages
    /// were new.
    pub fn merge_page(&mut self, items: Vec<ChatMessage>, next_cursor: Option<String>) -> usize {
        let added = self.merge_items(items);
        self.cursor = Cursor::from_next(next_cursor);
        added
    }

    /// Merge the newest page. Its cursor is adopted only before any page
    /// has been loaded; a reload never rewinds paging that already went
    /// further back.
    pub fn merge_newest(&mut self, items: Vec<ChatMessage>, next_cursor: Option<String>) -> usize {
        let added = self.merge_items(items);
        if self.cursor == Cursor::Unloaded {
            self.cursor = Cursor::from_next(next_cursor);
        }
        added
    }

    fn merge_items(&mut self, items: Vec<ChatMessage>) -> usize {
        let fresh: Vec<ChatMessage> = items
            .into_iter()
            .filter(|msg| self.ids.insert(msg.id.clone()))
            .collect();
        let added = fresh.len();

        if added > 0 {
            let mut merged = fresh;
            merged.append(&mut self.messages);
            // Stable: equal timestamps keep page-then-known order.
            merged.sort_by_key(|msg| msg.created_at);
            self.messages = merged;
        }
        added
    }

    /// Insert a live message after everything not newer than it. Returns
    /// false if the id is already known.
    pub fn push_live(&mut self, msg: ChatMessage) -> bool {
        if !self.ids.insert(msg.id.clone()) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|known| known.created_at <= msg.created_at);
        self.messages.insert(at, msg);
        true
    }

    /// The merged sequence, oldest first.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Check whether a message id is already in the timeline.
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Current pagination position.
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    /// Number of messages held.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if the timeline holds no messages.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Drop all messages and return to [`Cursor::Unloaded`].
    pub fn clear(&mut self) {
        self.messages.clear();
        self.ids.clear();
        self.cursor = Cursor::Unloaded;
    }
}

#[derive(Debug, Clone, Copy)]
enum PageKind {
    Newest,
    Older,
}

#[derive(Debug, Default)]
struct MergeState {
    /// Room the timeline belongs to; `None` until the first load.
    room_id: Option<String>,
    timeline: ChatTimeline,
}

impl MergeState {
    /// Live messages without a room id are attributed to the current room.
    fn accepts(&self, msg: &ChatMessage) -> bool {
        match &self.room_id {
            Some(room) => msg.room_id.is_empty() || &msg.room_id == room,
            None => true,
        }
    }
}

/// Keeps one room's merged chat sequence current.
pub struct HistoryMerger {
    /// Source of history pages.
    api: Arc<dyn RoomApi>,
    /// Page size requested per fetch.
    page_limit: Option<u32>,
    /// Shared with the live-chat bus handler.
    state: Arc<Mutex<MergeState>>,
    /// Bumped on reset and room switch; stale pages are dropped.
    generation: AtomicU64,
}

impl HistoryMerger {
    /// Create a merger fetching pages of `page_limit` from `api`.
    pub fn new(api: Arc<dyn RoomApi>, page_limit: Option<u32>) -> Self {
        Self {
            api,
            page_limit,
            state: Arc::new(Mutex::new(MergeState::default())),
            generation: AtomicU64::new(0),
        }
    }

    /// Feed live chat messages from `bus` into the timeline.
    pub fn attach(&self, bus: &EventBus) -> Subscription {
        let state = self.state.clone();
        bus.subscribe(move |event| {
            let RoomEvent::ChatMessage(msg) = event else {
                return;
            };
            let mut state = lock(&state);
            if !state.accepts(msg) {
                log::debug!("Ignoring chat for room {} outside current room", msg.room_id);
                return;
            }
            if !state.timeline.push_live(msg.clone()) {
                log::debug!("Live message {} already in history", msg.id);
            }
        })
    }

    /// Fetch the newest page for `room_id` and merge it with whatever has
    /// already arrived live. Switching rooms starts a fresh timeline.
    pub async fn load_initial(&self, room_id: &str) -> Result<Vec<ChatMessage>, SyncError> {
        let generation = {
            let mut state = lock(&self.state);
            match state.room_id.as_deref() {
                Some(current) if current == room_id => {}
                Some(_) => {
                    state.timeline.clear();
                    self.generation.fetch_add(1, Ordering::AcqRel);
                    state.room_id = Some(room_id.to_string());
                }
                None => state.room_id = Some(room_id.to_string()),
            }
            self.generation.load(Ordering::Acquire)
        };

        let query = HistoryQuery {
            after: None,
            limit: self.page_limit,
        };
        let page = self
            .api
            .history(room_id, &query)
            .await
            .map_err(SyncError::HistoryFetch)?;
        Ok(self.apply(generation, PageKind::Newest, page))
    }

    /// Fetch the next older page and prepend it. A no-op returning the
    /// current sequence when no cursor remains.
    pub async fn load_older(&self) -> Result<Vec<ChatMessage>, SyncError> {
        let (generation, room_id, after) = {
            let state = lock(&self.state);
            let cursor = match state.timeline.cursor() {
                Cursor::More(cursor) => cursor.clone(),
                Cursor::Unloaded | Cursor::Exhausted => {
                    return Ok(state.timeline.messages().to_vec());
                }
            };
            let Some(room_id) = state.room_id.clone() else {
                return Ok(state.timeline.messages().to_vec());
            };
            (self.generation.load(Ordering::Acquire), room_id, cursor)
        };

        let query = HistoryQuery {
            after: Some(after),
            limit: self.page_limit,
        };
        let page = self
            .api
            .history(&room_id, &query)
            .await
            .map_err(SyncError::HistoryFetch)?;
        Ok(self.apply(generation, PageKind::Older, page))
    }

    fn apply(&self, generation: u64, kind: PageKind, page: HistoryPage) -> Vec<ChatMessage> {
        let mut state = lock(&self.state);
        if self.generation.load(Ordering::Acquire) != generation {
            log::debug!("Discarding history page from a superseded load");
            return state.timeline.messages().to_vec();
        }
        let fetched = page.items.len();
        let added = match kind {
            PageKind::Newest => state.timeline.merge_newest(page.items, page.next_cursor),
            PageKind::Older => state.timeline.merge_page(page.items, page.next_cursor),
        };
        log::debug!("Merged history page: {added} new of {fetched}");
        state.timeline.messages().to_vec()
    }

    /// Current merged sequence.
    pub fn messages(&self) -> Vec<ChatMessage> {
        lock(&self.state).timeline.messages().to_vec()
    }

    /// Check whether an older page can still be fetched.
    pub fn has_older(&self) -> bool {
        matches!(lock(&self.state).timeline.cursor(), Cursor::More(_))
    }

    /// Number of merged messages.
    pub fn len(&self) -> usize {
        lock(&self.state).timeline.len()
    }

    /// Check if no messages have been merged yet.
    pub fn is_empty(&self) -> bool {
        lock(&self.state).timeline.is_empty()
    }

    /// Forget everything. Loads already in flight are discarded on arrival.
    pub fn reset(&self) {
        let mut state = lock(&self.state);
        self.generation.fetch_add(1, Ordering::AcqRel);
        state.room_id = None;
        state.timeline.clear();
    }
}

fn lock(state: &Mutex<MergeState>) -> MutexGuard<'_, MergeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
