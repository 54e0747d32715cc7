//! Capability seams shared by both storage tiers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    Conversation, ConversationId, LastMessage, Message, NewMessage, Reaction, SyncStatus, Tier,
};

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Page {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self { limit, offset }
    }

    pub fn clamped(self, cap: i64) -> Self {
        Self {
            limit: self.limit.clamp(1, cap),
            offset: self.offset.max(0),
        }
    }
}

/// Result of an edit: the store rewrites the record in place and hands the
/// pre-edit body back for the audit trail.
#[derive(Debug, Clone)]
pub struct EditOutcome {
    pub previous_body: String,
    pub message: Message,
}

/// Result of a delete: the live body is cleared, the original is returned
/// so the audit trail can retain it.
#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub original_body: String,
    pub message: Message,
}

/// Unified CRUD surface implemented by both tier adapters. Callers go
/// through the router; no caller addresses a store directly.
#[async_trait]
pub trait MessageStore: Send + Sync {
    fn tier(&self) -> Tier;

    async fn append(&self, new: NewMessage) -> AppResult<Message>;

    /// Chronologically ordered slice. Read failures degrade to an empty
    /// result with a logged warning.
    async fn read(&self, conversation_id: ConversationId, page: Page) -> AppResult<Vec<Message>>;

    async fn get(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
    ) -> AppResult<Option<Message>>;

    async fn edit(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        new_body: &str,
    ) -> AppResult<EditOutcome>;

    async fn delete(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        for_everyone: bool,
    ) -> AppResult<DeleteOutcome>;

    /// `Some(emoji)` sets/replaces the user's reaction, `None` removes it.
    async fn set_reaction(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        user_id: Uuid,
        emoji: Option<&str>,
    ) -> AppResult<Message>;

    async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> AppResult<Option<Conversation>>;

    /// Conversations the user participates in, most recently active first.
    async fn conversations_for(
        &self,
        user_id: Uuid,
        page: Page,
    ) -> AppResult<Vec<Conversation>>;

    /// Case-insensitive body substring match within one conversation.
    /// Deleted messages never match; a blank query matches nothing.
    async fn search(
        &self,
        conversation_id: ConversationId,
        query: &str,
    ) -> AppResult<Vec<Message>>;

    async fn mark_read(&self, conversation_id: ConversationId, user_id: Uuid) -> AppResult<()>;
}

/// Seam to the remote, strongly ordered ledger backing Regulated
/// conversations, and optionally the Personal-tier backup target.
/// Timestamps and sequence numbers assigned by the implementation are
/// authoritative.
#[async_trait]
pub trait RemoteLedger: Send + Sync {
    async fn append(&self, new: NewMessage) -> AppResult<Message>;

    async fn read(&self, conversation_id: ConversationId, page: Page) -> AppResult<Vec<Message>>;

    async fn get(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
    ) -> AppResult<Option<Message>>;

    async fn edit(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        new_body: &str,
    ) -> AppResult<EditOutcome>;

    async fn delete(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        for_everyone: bool,
    ) -> AppResult<DeleteOutcome>;

    async fn set_reaction(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        user_id: Uuid,
        emoji: Option<&str>,
    ) -> AppResult<Message>;

    async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> AppResult<Option<Conversation>>;

    async fn conversations_for(
        &self,
        user_id: Uuid,
        page: Page,
    ) -> AppResult<Vec<Conversation>>;

    async fn search(
        &self,
        conversation_id: ConversationId,
        query: &str,
    ) -> AppResult<Vec<Message>>;

    async fn mark_read(&self, conversation_id: ConversationId, user_id: Uuid) -> AppResult<()>;

    /// Idempotent copy of an already-committed local message, keyed by its
    /// id. Used by the backup path only; ordering metadata is preserved.
    async fn backup(&self, message: &Message) -> AppResult<()>;
}

#[derive(Default)]
struct LedgerState {
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    next_seq: HashMap<ConversationId, i64>,
    backups: HashMap<Uuid, Message>,
}

/// In-process stand-in for the hosted ledger. A single write lock gives the
/// strong multi-writer ordering the real service provides.
#[derive(Default, Clone)]
pub struct InMemoryRemoteLedger {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryRemoteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/introspection helper for the backup path.
    pub async fn backed_up(&self, message_id: Uuid) -> Option<Message> {
        self.state.read().await.backups.get(&message_id).cloned()
    }

    pub async fn backup_count(&self) -> usize {
        self.state.read().await.backups.len()
    }
}

fn not_found(message_id: Uuid) -> AppError {
    AppError::NotFound(format!("message {message_id}"))
}

impl LedgerState {
    fn message_mut(
        &mut self,
        conversation_id: ConversationId,
        message_id: Uuid,
    ) -> AppResult<&mut Message> {
        self.messages
            .get_mut(&conversation_id)
            .and_then(|list| list.iter_mut().find(|m| m.id == message_id))
            .ok_or_else(|| not_found(message_id))
    }

    fn touch_conversation(&mut self, new: &NewMessage, message: &Message) {
        let now = message.created_at;
        let conversation = self
            .conversations
            .entry(new.conversation_id)
            .or_insert_with(|| {
                let mut participants = vec![new.sender_id];
                for r in &new.recipients {
                    if !participants.contains(r) {
                        participants.push(*r);
                    }
                }
                Conversation {
                    id: new.conversation_id,
                    participants,
                    last_message: None,
                    unread: HashMap::new(),
                    created_at: now,
                    updated_at: now,
                }
            });
        conversation.last_message = Some(LastMessage {
            preview: LastMessage::preview_of(&message.body),
            sender_id: message.sender_id,
            sent_at: now,
        });
        conversation.updated_at = now;
        for participant in conversation.participants.clone() {
            if participant != message.sender_id {
                *conversation.unread.entry(participant).or_insert(0) += 1;
            }
        }
    }
}

#[async_trait]
impl RemoteLedger for InMemoryRemoteLedger {
    async fn append(&self, new: NewMessage) -> AppResult<Message> {
        let mut state = self.state.write().await;
        let seq_slot = state.next_seq.entry(new.conversation_id).or_insert(0);
        *seq_slot += 1;
        let seq = *seq_slot;

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            body: new.body.clone(),
            message_type: new.message_type,
            seq,
            // Server-assigned and authoritative.
            created_at: Utc::now(),
            edited_at: None,
            deleted_at: None,
            deleted_for_everyone: false,
            reactions: Vec::new(),
            attachments: new.attachments.clone(),
            reply_to: new.reply_to,
            forwarded: new.forwarded,
            sync_status: SyncStatus::Synced,
        };

        state.touch_conversation(&new, &message);
        state
            .messages
            .entry(new.conversation_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn read(&self, conversation_id: ConversationId, page: Page) -> AppResult<Vec<Message>> {
        let state = self.state.read().await;
        let list = state
            .messages
            .get(&conversation_id)
            .map(|l| l.as_slice())
            .unwrap_or_default();
        let start = (page.offset.max(0) as usize).min(list.len());
        let end = (start + page.limit.max(0) as usize).min(list.len());
        Ok(list[start..end].to_vec())
    }

    async fn get(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
    ) -> AppResult<Option<Message>> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .get(&conversation_id)
            .and_then(|list| list.iter().find(|m| m.id == message_id))
            .cloned())
    }

    async fn edit(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        new_body: &str,
    ) -> AppResult<EditOutcome> {
        let mut state = self.state.write().await;
        let message = state.message_mut(conversation_id, message_id)?;
        if message.deleted_for_everyone {
            return Err(AppError::AlreadyDeleted);
        }
        let previous_body = std::mem::replace(&mut message.body, new_body.to_string());
        message.edited_at = Some(Utc::now());
        Ok(EditOutcome {
            previous_body,
            message: message.clone(),
        })
    }

    async fn delete(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        for_everyone: bool,
    ) -> AppResult<DeleteOutcome> {
        let mut state = self.state.write().await;
        let message = state.message_mut(conversation_id, message_id)?;
        if message.deleted_for_everyone {
            return Err(AppError::AlreadyDeleted);
        }
        let original_body = std::mem::take(&mut message.body);
        message.deleted_at = Some(Utc::now());
        message.deleted_for_everyone = for_everyone;
        Ok(DeleteOutcome {
            original_body,
            message: message.clone(),
        })
    }

    async fn set_reaction(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        user_id: Uuid,
        emoji: Option<&str>,
    ) -> AppResult<Message> {
        let mut state = self.state.write().await;
        let message = state.message_mut(conversation_id, message_id)?;
        if message.is_deleted() {
            return Err(AppError::AlreadyDeleted);
        }
        message.reactions.retain(|r| r.user_id != user_id);
        if let Some(emoji) = emoji {
            message.reactions.push(Reaction {
                emoji: emoji.to_string(),
                user_id,
                reacted_at: Utc::now(),
            });
        }
        Ok(message.clone())
    }

    async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> AppResult<Option<Conversation>> {
        Ok(self
            .state
            .read()
            .await
            .conversations
            .get(&conversation_id)
            .cloned())
    }

    async fn conversations_for(
        &self,
        user_id: Uuid,
        page: Page,
    ) -> AppResult<Vec<Conversation>> {
        let state = self.state.read().await;
        let mut list: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| c.is_participant(user_id))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        let start = (page.offset.max(0) as usize).min(list.len());
        let end = (start + page.limit.max(0) as usize).min(list.len());
        Ok(list[start..end].to_vec())
    }

    async fn search(
        &self,
        conversation_id: ConversationId,
        query: &str,
    ) -> AppResult<Vec<Message>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state.read().await;
        Ok(state
            .messages
            .get(&conversation_id)
            .map(|list| {
                list.iter()
                    .filter(|m| !m.is_deleted() && m.body.to_lowercase().contains(&needle))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_read(&self, conversation_id: ConversationId, user_id: Uuid) -> AppResult<()> {
        let mut state = self.state.write().await;
        if let Some(conversation) = state.conversations.get_mut(&conversation_id) {
            conversation.unread.insert(user_id, 0);
        }
        Ok(())
    }

    async fn backup(&self, message: &Message) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.backups.insert(message.id, message.clone());
        Ok(())
    }
}
