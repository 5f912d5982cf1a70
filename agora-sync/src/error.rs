//! Error taxonomy for the sync client.
//!
//! Transport and decode failures are absorbed inside the supervisor (they
//! become a reconnect or a dropped frame). History and join failures are
//! returned to whoever started the operation.

use crate::api::ApiError;
use crate::protocol::DecodeError;

/// Top-level error returned by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Connection-level failure. Non-fatal; the supervisor reconnects.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed inbound frame. Non-fatal; the frame is dropped.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// REST failure while paging history. Retrying is up to the caller.
    #[error("history fetch failed: {0}")]
    HistoryFetch(#[source] ApiError),

    /// REST join failure. Fatal to the session: nothing connects.
    #[error("joining room {room_id} failed: {source}")]
    Join {
        room_id: String,
        #[source]
        source: ApiError,
    },

    /// Invalid client configuration.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl SyncError {
    /// Whether the session can continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::Decode(_) | SyncError::HistoryFetch(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_error_is_fatal() {
        let err = SyncError::Join {
            room_id: "R1".into(),
            source: ApiError::Status { status: 403, message: "room is full".into() },
        };
        assert!(!err.is_recoverable());
        assert_eq!(err.to_string(), "joining room R1 failed: HTTP 403: room is full");
    }

    #[test]
    fn test_history_error_is_recoverable() {
        let err = SyncError::HistoryFetch(ApiError::Status {
            status: 500,
            message: "boom".into(),
        });
        assert!(err.is_recoverable());
        assert!(err.to_string().starts_with("history fetch failed"));
    }

    #[test]
    fn test_decode_error_converts() {
        let err: SyncError = DecodeError::Envelope("eof".into()).into();
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "frame is not a JSON envelope: eof");
    }
}
