use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Which backing store owns a conversation's messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Durable, centrally retained, multi-party accessible (compliance).
    Regulated,
    /// Private and device-local, no retention requirement.
    Personal,
}

/// Namespace tag minted together with every conversation id.
///
/// The tag is an explicit enum rather than a substring convention so a
/// personal conversation can never be misrouted by an id that happens to
/// contain a reserved word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Job,
    Admin,
    System,
    Personal,
}

impl ConversationKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ConversationKind::Job => "job",
            ConversationKind::Admin => "admin",
            ConversationKind::System => "system",
            ConversationKind::Personal => "personal",
        }
    }

    /// Pure, stable tier classification.
    pub fn tier(&self) -> Tier {
        match self {
            ConversationKind::Personal => Tier::Personal,
            _ => Tier::Regulated,
        }
    }
}

/// Typed conversation id, canonical text form `<tag>:<uuid>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationId {
    pub kind: ConversationKind,
    pub id: Uuid,
}

impl ConversationId {
    pub fn new(kind: ConversationKind, id: Uuid) -> Self {
        Self { kind, id }
    }

    pub fn mint(kind: ConversationKind) -> Self {
        Self::new(kind, Uuid::new_v4())
    }

    pub fn tier(&self) -> Tier {
        self.kind.tier()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.tag(), self.id)
    }
}

impl FromStr for ConversationId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, rest) = s
            .split_once(':')
            .ok_or_else(|| AppError::Validation(format!("conversation id without tag: {s:?}")))?;
        let kind = match tag {
            "job" => ConversationKind::Job,
            "admin" => ConversationKind::Admin,
            "system" => ConversationKind::System,
            "personal" => ConversationKind::Personal,
            other => {
                return Err(AppError::Validation(format!(
                    "unknown conversation tag: {other:?}"
                )))
            }
        };
        let id = Uuid::parse_str(rest)
            .map_err(|e| AppError::Validation(format!("bad conversation uuid {rest:?}: {e}")))?;
        Ok(Self { kind, id })
    }
}

impl TryFrom<String> for ConversationId {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ConversationId> for String {
    fn from(value: ConversationId) -> Self {
        value.to_string()
    }
}

/// Summary of the newest message, kept on the conversation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMessage {
    pub preview: String,
    pub sender_id: Uuid,
    pub sent_at: DateTime<Utc>,
}

impl LastMessage {
    const PREVIEW_CHARS: usize = 120;

    pub fn preview_of(body: &str) -> String {
        if body.chars().count() <= Self::PREVIEW_CHARS {
            body.to_string()
        } else {
            body.chars().take(Self::PREVIEW_CHARS).collect()
        }
    }
}

/// Conversation metadata, created lazily on first message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: Vec<Uuid>,
    pub last_message: Option<LastMessage>,
    /// Per-participant unread counter, reset by `mark_read`.
    pub unread: HashMap<Uuid, u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn tier(&self) -> Tier {
        self.id.tier()
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participants.contains(&user_id)
    }
}
