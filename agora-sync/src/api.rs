//! REST collaborators of a room session: join, leave, participants, and
//! chat history.
//!
//! [`RoomApi`] is the seam the session depends on; [`HttpRoomApi`] is the
//! reqwest implementation against the room gateway. Every request carries
//! `Authorization: Bearer <token>` and `X-User-ID`. Successful bodies are
//! wrapped as `{"data": ...}`; failures as `{"error": {"message": ...}}`.

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Credentials, SyncConfig};
use crate::model::{ChatMessage, Member};

/// REST failure.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Server answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Body did not have the expected shape.
    #[error("unexpected response body: {0}")]
    Decode(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// HTTP status, when the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Result of joining a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinReceipt {
    pub room_id: String,
    #[serde(default)]
    pub peer_id: String,
}

/// Paging parameters for [`RoomApi::history`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Opaque cursor from a previous page; `None` asks for the newest page.
    pub after: Option<String>,
    pub limit: Option<u32>,
}

/// One page of chat history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HistoryPage {
    #[serde(default)]
    pub items: Vec<ChatMessage>,
    /// Cursor for the next older page; `None` when history is exhausted.
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Room REST operations used by a session.
#[async_trait]
pub trait RoomApi: Send + Sync {
    /// Join `room_id`. Must succeed before the transport is opened.
    async fn join(&self, room_id: &str) -> Result<JoinReceipt, ApiError>;

    /// Leave `room_id`.
    async fn leave(&self, room_id: &str) -> Result<(), ApiError>;

    /// Authoritative member snapshot of `room_id`.
    async fn participants(&self, room_id: &str) -> Result<Vec<Member>, ApiError>;

    /// One page of chat history; `query.after` pages further back.
    async fn history(&self, room_id: &str, query: &HistoryQuery) -> Result<HistoryPage, ApiError>;
}

/// [`RoomApi`] over HTTP.
pub struct HttpRoomApi {
    base: Url,
    credentials: Credentials,
    http: reqwest::Client,
}

impl HttpRoomApi {
    /// Build a client for `config.api_base` with the configured timeout.
    pub fn new(config: &SyncConfig) -> Result<Self, ApiError> {
        let base = Url::parse(&config.api_base)
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {e}", config.api_base)))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(config.api_base.clone()));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout.min(std::time::Duration::from_secs(10)))
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            base,
            credentials: config.credentials.clone(),
            http,
        })
    }

    /// `{base}/rooms/{room_id}/{action}`
    pub fn room_endpoint(&self, room_id: &str, action: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["rooms", room_id, action]);
        }
        url
    }

    /// Send one request and return the unwrapped `data`, or `None` for an
    /// empty body.
    async fn call(&self, method: Method, url: Url) -> Result<Option<Value>, ApiError> {
        log::debug!("{method} {}", url.path());
        let response = self
            .http
            .request(method, url)
            .bearer_auth(&self.credentials.access_token)
            .header("X-User-ID", &self.credentials.user_id)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = response.text().await?;
        let payload: Option<Value> = if body.trim().is_empty() {
            None
        } else {
            serde_json::from_str(&body).ok()
        };

        if !status.is_success() {
            let message = payload
                .as_ref()
                .and_then(error_message)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        match payload {
            Some(value) => Ok(Some(unwrap_envelope(value))),
            None if body.trim().is_empty() => Ok(None),
            None => Err(ApiError::Decode("response is not JSON".into())),
        }
    }
}

#[async_trait]
impl RoomApi for HttpRoomApi {
    async fn join(&self, room_id: &str) -> Result<JoinReceipt, ApiError> {
        let data = self.call(Method::POST, self.room_endpoint(room_id, "join")).await?;
        match data {
            Some(value) => decode(value),
            None => Ok(JoinReceipt {
                room_id: room_id.to_string(),
                peer_id: String::new(),
            }),
        }
    }

    async fn leave(&self, room_id: &str) -> Result<(), ApiError> {
        self.call(Method::POST, self.room_endpoint(room_id, "leave")).await?;
        Ok(())
    }

    async fn participants(&self, room_id: &str) -> Result<Vec<Member>, ApiError> {
        let data = self
            .call(Method::GET, self.room_endpoint(room_id, "participants"))
            .await?;
        let Some(value) = data else {
            return Ok(Vec::new());
        };
        Ok(match decode::<ParticipantsBody>(value)? {
            ParticipantsBody::Wrapped { items } => items,
            ParticipantsBody::Bare(items) => items,
        })
    }

    async fn history(&self, room_id: &str, query: &HistoryQuery) -> Result<HistoryPage, ApiError> {
        let mut url = self.room_endpoint(room_id, "chat");
        if query.after.is_some() || query.limit.is_some() {
            let mut pairs = url.query_pairs_mut();
            if let Some(after) = &query.after {
                pairs.append_pair("after", after);
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
        }
        let Some(value) = self.call(Method::GET, url).await? else {
            return Ok(HistoryPage::default());
        };
        let mut page: HistoryPage = decode(value)?;
        // The gateway omits or blanks the cursor on the last page.
        if page.next_cursor.as_deref().is_some_and(str::is_empty) {
            page.next_cursor = None;
        }
        Ok(page)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ParticipantsBody {
    Wrapped {
        #[serde(default)]
        items: Vec<Member>,
    },
    Bare(Vec<Member>),
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))
}

/// `{"data": x}` → `x`; anything else passes through.
fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

/// Message from `{"error": {"message", "meta": {"reason"}}}` or `{"error": "..."}`.
fn error_message(payload: &Value) -> Option<String> {
    let error = payload.get("error")?;
    if let Some(text) = error.as_str() {
        return Some(text.to_string());
    }
    let message = error.get("message")?.as_str()?;
    match error.pointer("/meta/reason").and_then(Value::as_str) {
        Some(reason) if !reason.is_empty() => Some(format!("{message}: {reason}")),
        _ => Some(message.to_string()),
    }
}
