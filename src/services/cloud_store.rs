//! Regulated-tier adapter over the hosted ledger. Thin by design: ordering,
//! timestamps and durability come from the remote side, which must cope
//! with concurrent writers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{Conversation, ConversationId, Message, NewMessage, Tier};
use crate::services::store::{DeleteOutcome, EditOutcome, MessageStore, Page, RemoteLedger};

pub struct CloudMessageStore {
    ledger: Arc<dyn RemoteLedger>,
    page_cap: i64,
}

impl CloudMessageStore {
    pub fn new(ledger: Arc<dyn RemoteLedger>, page_cap: i64) -> Arc<Self> {
        Arc::new(Self { ledger, page_cap })
    }

    /// Only regulated-tier conversations may reach this store.
    fn guard_tier(&self, conversation_id: &ConversationId) -> AppResult<()> {
        if conversation_id.tier() != Tier::Regulated {
            return Err(AppError::TierMismatch {
                conversation: conversation_id.to_string(),
                expected: Tier::Regulated,
                actual: conversation_id.tier(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for CloudMessageStore {
    fn tier(&self) -> Tier {
        Tier::Regulated
    }

    async fn append(&self, new: NewMessage) -> AppResult<Message> {
        self.guard_tier(&new.conversation_id)?;
        self.ledger.append(new).await
    }

    async fn read(&self, conversation_id: ConversationId, page: Page) -> AppResult<Vec<Message>> {
        self.guard_tier(&conversation_id)?;
        match self.ledger.read(conversation_id, page.clamped(self.page_cap)).await {
            Ok(messages) => Ok(messages),
            Err(e) => {
                warn!(conversation = %conversation_id, error = %e, "cloud read failed");
                Ok(Vec::new())
            }
        }
    }

    async fn get(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
    ) -> AppResult<Option<Message>> {
        self.guard_tier(&conversation_id)?;
        self.ledger.get(conversation_id, message_id).await
    }

    async fn edit(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        new_body: &str,
    ) -> AppResult<EditOutcome> {
        self.guard_tier(&conversation_id)?;
        self.ledger.edit(conversation_id, message_id, new_body).await
    }

    async fn delete(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        for_everyone: bool,
    ) -> AppResult<DeleteOutcome> {
        self.guard_tier(&conversation_id)?;
        self.ledger
            .delete(conversation_id, message_id, for_everyone)
            .await
    }

    async fn set_reaction(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        user_id: Uuid,
        emoji: Option<&str>,
    ) -> AppResult<Message> {
        self.guard_tier(&conversation_id)?;
        self.ledger
            .set_reaction(conversation_id, message_id, user_id, emoji)
            .await
    }

    async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> AppResult<Option<Conversation>> {
        self.guard_tier(&conversation_id)?;
        self.ledger.conversation(conversation_id).await
    }

    async fn conversations_for(
        &self,
        user_id: Uuid,
        page: Page,
    ) -> AppResult<Vec<Conversation>> {
        // User-scoped, not conversation-scoped: no tier guard applies.
        self.ledger
            .conversations_for(user_id, page.clamped(self.page_cap))
            .await
    }

    async fn search(
        &self,
        conversation_id: ConversationId,
        query: &str,
    ) -> AppResult<Vec<Message>> {
        self.guard_tier(&conversation_id)?;
        self.ledger.search(conversation_id, query).await
    }

    async fn mark_read(&self, conversation_id: ConversationId, user_id: Uuid) -> AppResult<()> {
        self.guard_tier(&conversation_id)?;
        self.ledger.mark_read(conversation_id, user_id).await
    }
}
