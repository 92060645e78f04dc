//! Data model (§3) and wire protocol payloads (§6).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Core entities (§3) ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct User {
    pub id: Uuid,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub last_seen_at: String,
    pub created_at: String,
}

/// `is_online` is never stored; it is derived from `last_seen_at` at read time (§4.6).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserPresence {
    pub id: Uuid,
    pub display_name: String,
    pub is_online: bool,
    pub last_seen_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationVariant {
    Direct,
    Group,
    Channel,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Conversation {
    pub id: Uuid,
    pub variant: ConversationVariant,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Admin,
    Member,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Membership {
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub role: MemberRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_read_message_id: Option<Uuid>,
    pub joined_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageVariant {
    Text,
    Image,
    Video,
    Voice,
    System,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub variant: MessageVariant,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<String>,
    pub created_at: String,
    /// Internal ordering column, not part of the wire contract (§6).
    #[serde(skip)]
    pub seq: i64,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reactions: Vec<ReactionSummary>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Reaction {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub emoji: String,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReactionSummary {
    pub emoji: String,
    pub count: i64,
    pub user_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    pub url: String,
    pub mime: String,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InviteToken {
    pub token: Uuid,
    pub conversation_id: Uuid,
    pub created_at: String,
}

// --- Wire protocol: client -> server (§6) ---

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Ping,
    Subscribe {
        #[serde(rename = "conversationIds")]
        conversation_ids: Vec<Uuid>,
    },
    Unsubscribe {
        #[serde(rename = "conversationIds")]
        conversation_ids: Vec<Uuid>,
    },
    SendMessage {
        id: Uuid,
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
        #[serde(default)]
        content: Option<String>,
        #[serde(rename = "type")]
        variant: MessageVariant,
        #[serde(rename = "replyToId", default)]
        reply_to_id: Option<Uuid>,
        #[serde(rename = "attachmentIds", default)]
        attachment_ids: Vec<Uuid>,
    },
    EditMessage {
        id: Uuid,
        content: String,
    },
    DeleteMessage {
        id: Uuid,
    },
    Typing {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    Read {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
        #[serde(rename = "messageId")]
        message_id: Uuid,
    },
    React {
        #[serde(rename = "messageId")]
        message_id: Uuid,
        #[serde(default)]
        emoji: Option<String>,
    },
}

// --- Wire protocol: server -> client (§6) ---

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Pong,
    MessageAck {
        id: Uuid,
        status: AckStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    NewMessage(Box<Message>),
    MessageUpdated {
        id: Uuid,
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
        content: String,
        #[serde(rename = "editedAt")]
        edited_at: String,
    },
    MessageDeleted {
        id: Uuid,
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
    },
    DeliveryReceipt {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
        #[serde(rename = "messageId")]
        message_id: Uuid,
        #[serde(rename = "deliveredAt")]
        delivered_at: String,
    },
    ReadReceipt {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
        #[serde(rename = "userId")]
        user_id: Uuid,
        #[serde(rename = "messageId")]
        message_id: Uuid,
        #[serde(rename = "readAt")]
        read_at: String,
    },
    Typing {
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
        #[serde(rename = "userId")]
        user_id: Uuid,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    Presence {
        #[serde(rename = "userId")]
        user_id: Uuid,
        status: PresenceStatus,
        #[serde(rename = "lastSeenAt")]
        last_seen_at: String,
    },
    ReactionUpdated {
        #[serde(rename = "messageId")]
        message_id: Uuid,
        #[serde(rename = "conversationId")]
        conversation_id: Uuid,
        #[serde(rename = "userId")]
        user_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        emoji: Option<String>,
    },
    Error {
        code: String,
        message: String,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    Error,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}
