use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Maximum message length in code points.
pub const MAX_CONTENT_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Parent,
    Teacher,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Parent => "parent",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "student" => Some(Role::Student),
            "parent" => Some(Role::Parent),
            "teacher" => Some(Role::Teacher),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::File => "file",
            MessageType::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<MessageType> {
        match s {
            "text" => Some(MessageType::Text),
            "image" => Some(MessageType::Image),
            "file" => Some(MessageType::File),
            "system" => Some(MessageType::System),
            _ => None,
        }
    }
}

/// Delivery state of a message. The sent -> delivered -> read chain only
/// moves forward; failed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<MessageStatus> {
        match s {
            "sent" => Some(MessageStatus::Sent),
            "delivered" => Some(MessageStatus::Delivered),
            "read" => Some(MessageStatus::Read),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OnlineStatus {
    Online,
    Offline,
    Away,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Direct,
    Group,
    Support,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationType::Direct => "direct",
            ConversationType::Group => "group",
            ConversationType::Support => "support",
        }
    }

    pub fn parse(s: &str) -> Option<ConversationType> {
        match s {
            "direct" => Some(ConversationType::Direct),
            "group" => Some(ConversationType::Group),
            "support" => Some(ConversationType::Support),
            _ => None,
        }
    }
}

/// A user as mirrored from the platform's identity service.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// Position in the conversation's total order, assigned at acceptance.
    pub seq: i64,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_role: Role,
    pub recipient_id: Option<String>,
    pub content: String,
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub is_read: bool,
    pub read_at: Option<i64>,
    pub read_by: Vec<String>,
    pub reply_to: Option<Uuid>,
    pub created_at: i64,
    pub updated_at: Option<i64>,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Conversation {
    pub id: Uuid,
    pub conversation_type: ConversationType,
    pub created_by: String,
    pub created_at: i64,
    pub participants: Vec<String>,
    pub last_message_content: Option<String>,
    pub last_message_at: Option<i64>,
    pub last_message_by: Option<String>,
    pub total_messages: i64,
    pub is_active: bool,
}

/// A conversation as seen by one participant, with their private flags.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub conversation_type: ConversationType,
    pub participants: Vec<String>,
    pub last_message_content: Option<String>,
    pub last_message_at: Option<i64>,
    pub last_message_by: Option<String>,
    pub total_messages: i64,
    pub unread_count: i64,
    pub is_muted: bool,
    pub is_archived: bool,
}

/// Presence as reported to clients and the online-users endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserPresence {
    pub user_id: String,
    pub username: String,
    pub display_name: String,
    pub role: Role,
    pub online_status: OnlineStatus,
    pub last_seen: i64,
}
