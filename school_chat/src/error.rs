use axum::http::StatusCode;
use thiserror::Error;

/// Close codes sent when a connection is terminated by policy.
pub mod close_code {
    pub const AUTH_TIMEOUT: u16 = 4401;
    pub const UNAUTHORIZED: u16 = 4403;
    pub const NOT_A_PARTICIPANT: u16 = 4404;
    pub const UNRESPONSIVE: u16 = 4408;
    pub const CONNECTION_EVICTED: u16 = 4409;
    pub const PROTOCOL_ABUSE: u16 = 4429;
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("authentication not completed in time")]
    AuthTimeout,
    #[error("invalid or expired token")]
    Unauthorized,
    #[error("user is not a participant of this conversation")]
    NotAParticipant,
    #[error("participant set is not valid for this conversation type")]
    InvalidParticipants,
    #[error("message content exceeds the allowed length")]
    ContentTooLong,
    #[error("message content is empty")]
    EmptyContent,
    #[error("role policy forbids messaging this recipient")]
    PermissionDenied,
    #[error("storage unavailable, retry the request")]
    StorageUnavailable,
    #[error("malformed frame threshold exceeded")]
    ProtocolAbuse,
    #[error("connection evicted by device limit")]
    ConnectionEvicted,
    #[error("connection stopped responding")]
    Unresponsive,
    #[error("not found")]
    NotFound,
    #[error("reply target is not part of this conversation")]
    InvalidReplyTo,
    #[error("pagination cursor is not valid")]
    InvalidCursor,
    #[error("edit window has elapsed")]
    EditWindowElapsed,
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl ChatError {
    /// Machine-readable code used in error frames and REST bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::AuthTimeout => "auth_timeout",
            ChatError::Unauthorized => "unauthorized",
            ChatError::NotAParticipant => "not_a_participant",
            ChatError::InvalidParticipants => "invalid_participants",
            ChatError::ContentTooLong => "content_too_long",
            ChatError::EmptyContent => "empty_content",
            ChatError::PermissionDenied => "permission_denied",
            ChatError::StorageUnavailable => "storage_unavailable",
            ChatError::ProtocolAbuse => "protocol_abuse",
            ChatError::ConnectionEvicted => "connection_evicted",
            ChatError::Unresponsive => "unresponsive",
            ChatError::NotFound => "not_found",
            ChatError::InvalidReplyTo => "invalid_reply_to",
            ChatError::InvalidCursor => "invalid_cursor",
            ChatError::EditWindowElapsed => "edit_window_elapsed",
            ChatError::Storage(_) => "storage_unavailable",
        }
    }

    /// Raw storage failures are retried at the store boundary; everything
    /// else is a final verdict.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChatError::Storage(_))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::AuthTimeout | ChatError::Unauthorized => StatusCode::UNAUTHORIZED,
            ChatError::NotAParticipant
            | ChatError::PermissionDenied
            | ChatError::EditWindowElapsed => StatusCode::FORBIDDEN,
            ChatError::InvalidParticipants
            | ChatError::ContentTooLong
            | ChatError::EmptyContent
            | ChatError::InvalidReplyTo
            | ChatError::InvalidCursor => StatusCode::BAD_REQUEST,
            ChatError::NotFound => StatusCode::NOT_FOUND,
            ChatError::StorageUnavailable | ChatError::Storage(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ChatError::ProtocolAbuse
            | ChatError::ConnectionEvicted
            | ChatError::Unresponsive => StatusCode::CONFLICT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ChatError::PermissionDenied.code(), "permission_denied");
        assert_eq!(ChatError::StorageUnavailable.code(), "storage_unavailable");
        assert_eq!(ChatError::ContentTooLong.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn only_raw_storage_errors_retry() {
        assert!(ChatError::Storage(rusqlite::Error::InvalidQuery).is_transient());
        assert!(!ChatError::StorageUnavailable.is_transient());
        assert!(!ChatError::PermissionDenied.is_transient());
    }
}
