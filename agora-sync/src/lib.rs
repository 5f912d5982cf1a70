//! # agora-sync: Real-time room synchronization client
//!
//! Keeps one persistent WebSocket connection per room and turns it, plus the
//! room REST API, into a consistent local view: a merged chat timeline and a
//! presence list.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket    ┌─────────────────────────┐
//! │ room service │ ◄────────────► │ RoomClient (supervisor) │
//! └──────┬───────┘   JSON frames  │ reconnect + backoff     │
//!        │                        │ EventDeduplicator       │
//!        │ REST                   └───────────┬─────────────┘
//!        │ (join, leave,                      │ publish
//!        │  participants, chat)               ▼
//!        │                              ┌──────────┐
//!        │                              │ EventBus │── application handlers
//!        │                              └────┬─────┘
//!        │                     ┌─────────────┴─────────────┐
//!        │                     ▼                           ▼
//!        │             ┌───────────────┐          ┌─────────────────┐
//!        └───────────► │ HistoryMerger │          │ PresenceTracker │ ◄──┘
//!                      └───────────────┘          └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire frames (`{type, payload}`)
//! - [`supervisor`]: Pure reconnect state machine
//! - [`client`]: Connection supervisor event loop
//! - [`dedup`]: Duplicate suppression within one connection
//! - [`bus`]: Synchronous in-process fan-out
//! - [`history`]: Paginated + live chat merge
//! - [`presence`]: Online/stale classification
//! - [`api`]: REST collaborator
//! - [`session`]: Composition of all of the above per room

pub mod api;
pub mod backoff;
pub mod bus;
pub mod client;
pub mod config;
pub mod dedup;
pub mod error;
pub mod history;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod supervisor;

// Re-exports for convenience
pub use api::{ApiError, HistoryPage, HistoryQuery, HttpRoomApi, JoinReceipt, RoomApi};
pub use backoff::Backoff;
pub use bus::{BusStats, EventBus, Subscription};
pub use client::RoomClient;
pub use config::{ConfigError, Credentials, SyncConfig};
pub use dedup::EventDeduplicator;
pub use error::SyncError;
pub use history::{ChatTimeline, Cursor, HistoryMerger};
pub use model::{ChatMessage, Member, RoomEvent};
pub use presence::{PresenceAggregator, PresenceEntry, PresenceTracker};
pub use protocol::{DecodeError, InboundFrame, OutboundFrame};
pub use session::{RoomSession, SessionRegistry};
pub use supervisor::{ConnectionMachine, ConnectionState};
