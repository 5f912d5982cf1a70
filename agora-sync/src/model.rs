//! Room data model shared by every sync component.
//!
//! [`RoomEvent`] is the single event type flowing over the
//! [`EventBus`](crate::bus::EventBus). Connection lifecycle events are
//! produced by the supervisor itself; everything else is decoded from
//! inbound transport frames.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Prefix of surrogate ids given to chat messages that arrive without one.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// A room participant as reported by the presence snapshot or the
/// participants endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    #[serde(deserialize_with = "string_or_number")]
    pub user_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(alias = "joined_at_unix", deserialize_with = "timestamp")]
    pub joined_at: DateTime<Utc>,
    /// Refreshed by the server on every request the member makes.
    #[serde(
        rename = "last_seen",
        alias = "last_seen_at",
        alias = "last_seen_unix",
        deserialize_with = "timestamp"
    )]
    pub last_seen_at: DateTime<Utc>,
}

impl Member {
    /// Member seen for the first time at `now`.
    pub fn new(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            avatar_url: None,
            joined_at: now,
            last_seen_at: now,
        }
    }

    /// Name to show for this member, falling back to the user id.
    pub fn label(&self) -> String {
        match &self.display_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("User {}", self.user_id),
        }
    }
}

/// An immutable chat message.
///
/// Ordered by `created_at`; equal timestamps keep arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub user_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl ChatMessage {
    /// Whether the id was synthesized locally rather than assigned by the server.
    pub fn has_local_id(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }
}

/// Fresh surrogate id for a message the server did not identify.
pub fn local_message_id() -> String {
    format!("{LOCAL_ID_PREFIX}{}", uuid::Uuid::new_v4())
}

/// Everything a room subscriber can observe.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// Transport handshake completed.
    Opened,
    /// Transport closed (cleanly or after an error).
    Closed,
    /// Connection-level failure; a reconnect follows unless disconnected.
    TransportError { detail: String },
    /// Full membership set, replacing any previous one.
    PresenceSnapshot { members: Vec<Member> },
    PeerJoined { member: Member },
    PeerLeft { member_id: String },
    ChatMessage(ChatMessage),
    /// Server acknowledged one of our sends.
    ChatAck { reference: String },
}

impl RoomEvent {
    /// Stable identity used for duplicate suppression, if any.
    pub fn identity(&self) -> Option<&str> {
        match self {
            RoomEvent::ChatMessage(msg) => Some(msg.id.as_str()),
            _ => None,
        }
    }

    /// Whether this event is a connection lifecycle event.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            RoomEvent::Opened | RoomEvent::Closed | RoomEvent::TransportError { .. }
        )
    }
}

// ───────────────────────────────────────────────────────────────────
// Lenient field decoding
// ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrNumber {
    Text(String),
    Int(i64),
}

pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match StringOrNumber::deserialize(deserializer)? {
        StringOrNumber::Text(s) => s,
        StringOrNumber::Int(n) => n.to_string(),
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TimestampRepr {
    Text(DateTime<Utc>),
    Unix(i64),
}

pub(crate) fn timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    match TimestampRepr::deserialize(deserializer)? {
        TimestampRepr::Text(ts) => Ok(ts),
        TimestampRepr::Unix(secs) => unix_seconds(secs)
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {secs}"))),
    }
}

/// Convert unix seconds to a UTC timestamp.
pub fn unix_seconds(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}
