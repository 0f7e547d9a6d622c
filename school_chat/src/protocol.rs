use crate::model::{Message, MessageType, OnlineStatus};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

/// Frames a client may send while a connection is active (or, for
/// `authentication`, while it is still proving who it is).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Authentication {
        token: String,
    },
    Message {
        conversation_id: Uuid,
        content: String,
        #[serde(default)]
        message_type: MessageType,
        #[serde(default)]
        reply_to: Option<Uuid>,
        #[serde(default)]
        client_key: Option<String>,
    },
    MessageTyping {
        conversation_id: Uuid,
    },
    MessageRead {
        message_id: Uuid,
        conversation_id: Uuid,
    },
    Ping {
        #[serde(default)]
        timestamp: Option<String>,
    },
    Status {
        status: OnlineStatus,
    },
}

/// Frames the server pushes to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Message {
        message: Message,
    },
    MessageTyping {
        conversation_id: Uuid,
        user_id: String,
    },
    MessageRead {
        conversation_id: Uuid,
        message_id: Option<Uuid>,
        user_id: String,
        read_at: i64,
    },
    MessageUpdated {
        message: Message,
    },
    MessageDeleted {
        conversation_id: Uuid,
        message_id: Uuid,
    },
    Presence {
        user_id: String,
        status: OnlineStatus,
        last_seen: i64,
    },
    Snapshot {
        conversation_id: Uuid,
        unread_count: i64,
        total_messages: i64,
    },
    Pong {
        timestamp: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl OutboundFrame {
    /// Essential frames survive backpressure; the rest may be shed.
    pub fn essential(&self) -> bool {
        !matches!(
            self,
            OutboundFrame::MessageTyping { .. }
                | OutboundFrame::Presence { .. }
                | OutboundFrame::Pong { .. }
        )
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
