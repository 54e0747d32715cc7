use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::conversation::ConversationId;
use super::message::Attachment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditEventType {
    Created,
    Edited,
    Deleted,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::Created => "created",
            AuditEventType::Edited => "edited",
            AuditEventType::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(AuditEventType::Created),
            "edited" => Some(AuditEventType::Edited),
            "deleted" => Some(AuditEventType::Deleted),
            _ => None,
        }
    }
}

/// Attachment reference as captured for dispute purposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentDigest {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    pub hash: String,
}

impl AttachmentDigest {
    pub fn of(attachment: &Attachment) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(attachment.url.as_bytes());
        if let Some(name) = &attachment.name {
            hasher.update(name.as_bytes());
        }
        Self {
            url: attachment.url.clone(),
            name: attachment.name.clone(),
            hash: hex::encode(hasher.finalize()),
        }
    }
}

/// The hashed portion of an audit entry. Serialization order is fixed by
/// the struct definitions, so `hash()` is reproducible by any reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditPayload {
    Created {
        content: String,
        recipient_ids: Vec<Uuid>,
        attachments: Vec<AttachmentDigest>,
    },
    Edited {
        old_content: String,
        new_content: String,
        #[serde(default)]
        reason: Option<String>,
    },
    Deleted {
        original_content: String,
        soft_delete: bool,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl AuditPayload {
    pub fn event_type(&self) -> AuditEventType {
        match self {
            AuditPayload::Created { .. } => AuditEventType::Created,
            AuditPayload::Edited { .. } => AuditEventType::Edited,
            AuditPayload::Deleted { .. } => AuditEventType::Deleted,
        }
    }

    /// SHA-256 over the canonical JSON encoding, hex-lowercase.
    pub fn hash(&self) -> Result<String, serde_json::Error> {
        let bytes = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

/// Immutable record of one message lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub message_id: Uuid,
    pub conversation_id: ConversationId,
    pub event_type: AuditEventType,
    pub actor_id: Uuid,
    pub content_hash: String,
    pub device_fingerprint: String,
    pub recorded_at: DateTime<Utc>,
    pub payload: AuditPayload,
}

/// Lifecycle events emitted by the router and consumed out-of-band by the
/// audit worker. Failure to record one never propagates to the sender.
#[derive(Debug, Clone)]
pub enum AuditEvent {
    MessageCreated {
        message_id: Uuid,
        conversation_id: ConversationId,
        sender_id: Uuid,
        recipient_ids: Vec<Uuid>,
        content: String,
        attachments: Vec<Attachment>,
    },
    MessageEdited {
        message_id: Uuid,
        editor_id: Uuid,
        old_content: String,
        new_content: String,
        reason: Option<String>,
    },
    MessageDeleted {
        message_id: Uuid,
        deleter_id: Uuid,
        original_content: String,
        soft_delete: bool,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Portable report handed to external compliance tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeReport {
    pub conversation_id: ConversationId,
    pub exported_at: DateTime<Utc>,
    pub range: ReportRange,
    pub total_entries: usize,
    pub entries: Vec<AuditEntry>,
}

impl DisputeReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
