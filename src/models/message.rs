use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::conversation::ConversationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    File,
    Voice,
    Location,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::File => "file",
            MessageType::Voice => "voice",
            MessageType::Location => "location",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageType::Text),
            "image" => Some(MessageType::Image),
            "file" => Some(MessageType::File),
            "voice" => Some(MessageType::Voice),
            "location" => Some(MessageType::Location),
            _ => None,
        }
    }
}

/// Backup replication state. Only meaningful for Personal-tier messages;
/// Regulated-tier messages are born durable and reported as `Synced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "synced" => Some(SyncStatus::Synced),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// One reaction per user per message; re-reacting replaces the previous emoji.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub user_id: Uuid,
    pub reacted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub sender_id: Uuid,
    /// Cleared in place on delete; full history lives in the audit trail.
    pub body: String,
    pub message_type: MessageType,
    /// Per-conversation logical sequence assigned by the owning store.
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_for_everyone: bool,
    pub reactions: Vec<Reaction>,
    pub attachments: Vec<Attachment>,
    pub reply_to: Option<Uuid>,
    pub forwarded: bool,
    pub sync_status: SyncStatus,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Live body, or `None` once the message has been deleted.
    pub fn visible_body(&self) -> Option<&str> {
        if self.is_deleted() {
            None
        } else {
            Some(&self.body)
        }
    }
}

/// Append request. `recipients` seeds the participant set when the
/// conversation does not exist yet and feeds the audit trail.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: Uuid,
    pub recipients: Vec<Uuid>,
    pub body: String,
    pub message_type: MessageType,
    pub attachments: Vec<Attachment>,
    pub reply_to: Option<Uuid>,
    pub forwarded: bool,
}

impl NewMessage {
    pub fn text(conversation_id: ConversationId, sender_id: Uuid, body: impl Into<String>) -> Self {
        Self {
            conversation_id,
            sender_id,
            recipients: Vec::new(),
            body: body.into(),
            message_type: MessageType::Text,
            attachments: Vec::new(),
            reply_to: None,
            forwarded: false,
        }
    }

    pub fn with_recipients(mut self, recipients: Vec<Uuid>) -> Self {
        self.recipients = recipients;
        self
    }

    pub fn replying_to(mut self, message_id: Uuid) -> Self {
        self.reply_to = Some(message_id);
        self
    }
}

/// Resolution of a `reply_to` reference at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyContext {
    None,
    Available { sender_id: Uuid, preview: String },
    /// The referenced message is gone (hard-deleted or never stored here);
    /// render "original message unavailable".
    Unavailable,
}

/// Message plus read-time context, the shape handed to the UI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub message: Message,
    pub reply: ReplyContext,
}
