use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::conversation::ConversationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// One record per user, overwritten in place on connect/heartbeat/disconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub status: PresenceStatus,
    pub last_seen_at: DateTime<Utc>,
}

impl PresenceRecord {
    /// Fallback record for users we have never heard from. Readers degrade
    /// to offline rather than erroring (a presence glitch must not crash a
    /// message view).
    pub fn offline(user_id: Uuid) -> Self {
        Self {
            user_id,
            status: PresenceStatus::Offline,
            last_seen_at: Utc::now(),
        }
    }
}

/// Ephemeral typing indicator. Freshness is judged against the runtime
/// clock (`refreshed_at`), so a crashed writer can never pin an indicator:
/// readers drop the state once its age reaches the TTL whether or not the
/// writer-side auto-clear ever ran.
#[derive(Debug, Clone)]
pub struct TypingState {
    pub conversation_id: ConversationId,
    pub user_id: Uuid,
    pub is_typing: bool,
    pub updated_at: DateTime<Utc>,
    pub(crate) refreshed_at: tokio::time::Instant,
}

impl TypingState {
    pub fn started(conversation_id: ConversationId, user_id: Uuid) -> Self {
        Self {
            conversation_id,
            user_id,
            is_typing: true,
            updated_at: Utc::now(),
            refreshed_at: tokio::time::Instant::now(),
        }
    }

    /// Mandatory reader-side check: stale state is never reported as typing.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.is_typing && self.refreshed_at.elapsed() < ttl
    }
}
