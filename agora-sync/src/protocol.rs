//! JSON wire protocol spoken over the room transport.
//!
//! Every frame is an envelope:
//! ```text
//! { "type": "state" | "peer_joined" | "peer_left" | "chat" | "chat_ack",
//!   "payload": { ... } }
//! ```
//!
//! Decoding happens in two stages: the envelope first, then the payload by
//! tag. Unknown tags become [`InboundFrame::Ignored`] rather than errors, so
//! a newer server never breaks an older client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{self, ChatMessage, Member, RoomEvent};

/// Frame tags understood by the client.
pub mod kind {
    pub const STATE: &str = "state";
    pub const PEER_JOINED: &str = "peer_joined";
    pub const PEER_LEFT: &str = "peer_left";
    pub const CHAT: &str = "chat";
    pub const CHAT_ACK: &str = "chat_ack";
}

/// A malformed inbound frame. Never fatal: the frame is logged and dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is not a JSON envelope: {0}")]
    Envelope(String),
    #[error("malformed `{kind}` payload: {reason}")]
    Payload { kind: String, reason: String },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct StatePayload {
    #[serde(alias = "participants", default)]
    members: Vec<Member>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PeerJoinedPayload {
    Full { member: Member },
    Bare {
        #[serde(deserialize_with = "model::string_or_number")]
        user_id: String,
    },
}

#[derive(Deserialize)]
struct PeerLeftPayload {
    #[serde(
        rename = "memberId",
        alias = "member_id",
        alias = "user_id",
        deserialize_with = "model::string_or_number"
    )]
    member_id: String,
}

/// Payload of an inbound `chat` frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatPayload {
    #[serde(default)]
    pub msg_id: Option<String>,
    #[serde(default)]
    pub room_id: String,
    #[serde(deserialize_with = "model::string_or_number")]
    pub user_id: String,
    pub message: String,
    #[serde(default)]
    pub ts_unix: Option<i64>,
}

impl ChatPayload {
    /// Build the message, filling a surrogate id and the receive time when
    /// the server omitted them.
    pub fn into_message(self, received_at: DateTime<Utc>) -> ChatMessage {
        let id = match self.msg_id {
            Some(id) if !id.is_empty() => id,
            _ => model::local_message_id(),
        };
        let created_at = self
            .ts_unix
            .filter(|ts| *ts > 0)
            .and_then(model::unix_seconds)
            .unwrap_or(received_at);
        ChatMessage {
            id,
            room_id: self.room_id,
            user_id: self.user_id,
            text: self.message,
            created_at,
            reply_to: None,
        }
    }
}

#[derive(Deserialize)]
struct ChatAckPayload {
    msg_id: String,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    State { members: Vec<Member> },
    PeerJoined { member: Member },
    PeerLeft { member_id: String },
    Chat(ChatPayload),
    ChatAck { msg_id: String },
    /// Well-formed envelope with a tag this client does not handle.
    Ignored { kind: String },
}

impl InboundFrame {
    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        Self::decode_at(text, Utc::now())
    }

    /// Decode one text frame, using `now` for fields the server left out.
    pub fn decode_at(text: &str, now: DateTime<Utc>) -> Result<Self, DecodeError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| DecodeError::Envelope(e.to_string()))?;

        let frame = match envelope.kind.as_str() {
            kind::STATE => {
                let p: StatePayload = payload(&envelope)?;
                InboundFrame::State { members: p.members }
            }
            kind::PEER_JOINED => match payload(&envelope)? {
                PeerJoinedPayload::Full { member } => InboundFrame::PeerJoined { member },
                PeerJoinedPayload::Bare { user_id } => InboundFrame::PeerJoined {
                    member: Member::new(user_id, now),
                },
            },
            kind::PEER_LEFT => {
                let p: PeerLeftPayload = payload(&envelope)?;
                InboundFrame::PeerLeft { member_id: p.member_id }
            }
            kind::CHAT => InboundFrame::Chat(payload(&envelope)?),
            kind::CHAT_ACK => {
                let p: ChatAckPayload = payload(&envelope)?;
                InboundFrame::ChatAck { msg_id: p.msg_id }
            }
            _ => InboundFrame::Ignored { kind: envelope.kind },
        };
        Ok(frame)
    }

    /// Convert into a bus event. `Ignored` frames produce nothing.
    pub fn into_event(self, received_at: DateTime<Utc>) -> Option<RoomEvent> {
        match self {
            InboundFrame::State { members } => Some(RoomEvent::PresenceSnapshot { members }),
            InboundFrame::PeerJoined { member } => Some(RoomEvent::PeerJoined { member }),
            InboundFrame::PeerLeft { member_id } => Some(RoomEvent::PeerLeft { member_id }),
            InboundFrame::Chat(p) => Some(RoomEvent::ChatMessage(p.into_message(received_at))),
            InboundFrame::ChatAck { msg_id } => Some(RoomEvent::ChatAck { reference: msg_id }),
            InboundFrame::Ignored { .. } => None,
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Result<T, DecodeError> {
    T::deserialize(&envelope.payload).map_err(|e| DecodeError::Payload {
        kind: envelope.kind.clone(),
        reason: e.to_string(),
    })
}

/// Frames the client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundFrame {
    Chat { message: String },
}

impl OutboundFrame {
    pub fn chat(message: impl Into<String>) -> Self {
        OutboundFrame::Chat { message: message.into() }
    }

    /// Serialize to the text wire format.
    pub fn encode(&self) -> String {
        // A struct of plain strings always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}
