//! Tier classification and the unified message facade.
//!
//! Callers never talk to a store directly: the router classifies the
//! conversation, dispatches to the tier adapter, emits the audit event and
//! publishes the mutation on the in-process event bus. Audit emission is
//! fire-and-forget; a failed audit write never fails a send.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::events::{MessageEvent, MessageEventBus, SubscriptionId};
use crate::models::{
    AuditEvent, Conversation, ConversationId, LastMessage, Message, MessageView, NewMessage,
    ReplyContext, Tier,
};
use crate::retry::{with_retry_if, RetryConfig};
use crate::services::audit_trail::AuditSink;
use crate::services::cloud_store::CloudMessageStore;
use crate::services::local_store::LocalMessageStore;
use crate::services::store::{MessageStore, Page};

/// Pure, stable classification. Same id, same tier, always.
pub fn classify(conversation_id: &ConversationId) -> Tier {
    conversation_id.kind.tier()
}

/// Boundary form for callers holding a raw id string. Malformed ids fail
/// validation instead of silently defaulting to a tier.
pub fn classify_str(raw: &str) -> AppResult<Tier> {
    raw.parse::<ConversationId>().map(|id| classify(&id))
}

pub struct StorageRouter {
    local: Arc<LocalMessageStore>,
    cloud: Arc<CloudMessageStore>,
    audit: AuditSink,
    events: MessageEventBus,
    send_retry: RetryConfig,
}

impl StorageRouter {
    pub fn new(
        local: Arc<LocalMessageStore>,
        cloud: Arc<CloudMessageStore>,
        audit: AuditSink,
        events: MessageEventBus,
        send_retry: RetryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            cloud,
            audit,
            events,
            send_retry,
        })
    }

    fn store_for(&self, conversation_id: &ConversationId) -> Arc<dyn MessageStore> {
        match classify(conversation_id) {
            Tier::Personal => self.local.clone(),
            Tier::Regulated => self.cloud.clone(),
        }
    }

    /// Defensive participant check. Authorization proper happens upstream;
    /// this only catches callers that slipped through with the wrong user.
    async fn ensure_participant(
        &self,
        store: &Arc<dyn MessageStore>,
        conversation_id: ConversationId,
        user_id: Uuid,
    ) -> AppResult<()> {
        if let Some(conversation) = store.conversation(conversation_id).await? {
            if !conversation.is_participant(user_id) {
                return Err(AppError::Permission(format!(
                    "user {user_id} is not a participant of {conversation_id}"
                )));
            }
        }
        Ok(())
    }

    pub async fn append(&self, new: NewMessage) -> AppResult<Message> {
        if new.body.trim().is_empty() && new.attachments.is_empty() {
            return Err(AppError::Validation("empty message body".into()));
        }
        let store = self.store_for(&new.conversation_id);
        self.ensure_participant(&store, new.conversation_id, new.sender_id)
            .await?;

        // Transient failures retry with backoff; on exhaustion the error
        // surfaces so the UI can offer a user-driven retry.
        let message = with_retry_if(
            &self.send_retry,
            || {
                let store = store.clone();
                let new = new.clone();
                async move { store.append(new).await }
            },
            AppError::is_retryable,
        )
        .await?;
        debug!(conversation = %new.conversation_id, message = %message.id, "message appended");

        self.audit.record(AuditEvent::MessageCreated {
            message_id: message.id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            recipient_ids: new.recipients.clone(),
            content: message.body.clone(),
            attachments: message.attachments.clone(),
        });
        self.events
            .publish(MessageEvent::Appended {
                message: message.clone(),
            })
            .await;
        Ok(message)
    }

    /// Chronologically ordered page with reply references resolved. A reply
    /// whose target is hard-deleted (or unknown) reads as `Unavailable`.
    pub async fn read(
        &self,
        conversation_id: ConversationId,
        page: Page,
    ) -> AppResult<Vec<MessageView>> {
        let store = self.store_for(&conversation_id);
        let messages = store.read(conversation_id, page).await?;

        let mut targets: HashMap<Uuid, ReplyContext> = HashMap::new();
        for reply_to in messages.iter().filter_map(|m| m.reply_to) {
            if targets.contains_key(&reply_to) {
                continue;
            }
            let context = match store.get(conversation_id, reply_to).await? {
                Some(target) if !target.deleted_for_everyone => ReplyContext::Available {
                    sender_id: target.sender_id,
                    preview: LastMessage::preview_of(&target.body),
                },
                _ => ReplyContext::Unavailable,
            };
            targets.insert(reply_to, context);
        }

        Ok(messages
            .into_iter()
            .map(|message| {
                let reply = match message.reply_to {
                    Some(id) => targets.get(&id).cloned().unwrap_or(ReplyContext::Unavailable),
                    None => ReplyContext::None,
                };
                MessageView { message, reply }
            })
            .collect())
    }

    pub async fn edit(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        actor_id: Uuid,
        new_body: &str,
    ) -> AppResult<Message> {
        if new_body.trim().is_empty() {
            return Err(AppError::Validation("empty message body".into()));
        }
        let store = self.store_for(&conversation_id);
        let current = store
            .get(conversation_id, message_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;
        if current.sender_id != actor_id {
            return Err(AppError::Permission(format!(
                "user {actor_id} cannot edit a message sent by {}",
                current.sender_id
            )));
        }

        let outcome = store.edit(conversation_id, message_id, new_body).await?;

        self.audit.record(AuditEvent::MessageEdited {
            message_id,
            editor_id: actor_id,
            old_content: outcome.previous_body,
            new_content: new_body.to_string(),
            reason: None,
        });
        self.events
            .publish(MessageEvent::Edited {
                conversation_id,
                message_id,
                new_body: new_body.to_string(),
            })
            .await;
        Ok(outcome.message)
    }

    pub async fn delete(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        actor_id: Uuid,
        for_everyone: bool,
    ) -> AppResult<()> {
        let store = self.store_for(&conversation_id);
        let current = store
            .get(conversation_id, message_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;
        if for_everyone && current.sender_id != actor_id {
            return Err(AppError::Permission(format!(
                "user {actor_id} cannot delete for everyone a message sent by {}",
                current.sender_id
            )));
        }
        if !for_everyone {
            self.ensure_participant(&store, conversation_id, actor_id)
                .await?;
        }

        let outcome = store
            .delete(conversation_id, message_id, for_everyone)
            .await?;

        self.audit.record(AuditEvent::MessageDeleted {
            message_id,
            deleter_id: actor_id,
            original_content: outcome.original_body,
            soft_delete: !for_everyone,
            reason: None,
        });
        self.events
            .publish(MessageEvent::Deleted {
                conversation_id,
                message_id,
                for_everyone,
            })
            .await;
        Ok(())
    }

    pub async fn add_reaction(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        user_id: Uuid,
        emoji: &str,
    ) -> AppResult<Message> {
        let store = self.store_for(&conversation_id);
        let message = store
            .set_reaction(conversation_id, message_id, user_id, Some(emoji))
            .await?;
        self.events
            .publish(MessageEvent::Reacted {
                conversation_id,
                message_id,
                user_id,
                emoji: Some(emoji.to_string()),
            })
            .await;
        Ok(message)
    }

    pub async fn remove_reaction(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Message> {
        let store = self.store_for(&conversation_id);
        let message = store
            .set_reaction(conversation_id, message_id, user_id, None)
            .await?;
        self.events
            .publish(MessageEvent::Reacted {
                conversation_id,
                message_id,
                user_id,
                emoji: None,
            })
            .await;
        Ok(message)
    }

    /// Re-append the original content into each target conversation, routed
    /// per target tier. Forwarding a hard-deleted message is refused.
    pub async fn forward(
        &self,
        from: ConversationId,
        message_id: Uuid,
        to: &[ConversationId],
        sender_id: Uuid,
    ) -> AppResult<Vec<Message>> {
        let source = self.store_for(&from);
        let original = source
            .get(from, message_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;
        if original.is_deleted() {
            return Err(AppError::AlreadyDeleted);
        }

        let mut forwarded = Vec::with_capacity(to.len());
        for target in to {
            let new = NewMessage {
                conversation_id: *target,
                sender_id,
                recipients: Vec::new(),
                body: original.body.clone(),
                message_type: original.message_type,
                attachments: original.attachments.clone(),
                reply_to: None,
                forwarded: true,
            };
            forwarded.push(self.append(new).await?);
        }
        Ok(forwarded)
    }

    pub async fn mark_read(&self, conversation_id: ConversationId, user_id: Uuid) -> AppResult<()> {
        self.store_for(&conversation_id)
            .mark_read(conversation_id, user_id)
            .await
    }

    pub async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> AppResult<Option<Conversation>> {
        self.store_for(&conversation_id)
            .conversation(conversation_id)
            .await
    }

    /// The user's conversations merged across both tiers, most recently
    /// active first.
    pub async fn list_conversations(
        &self,
        user_id: Uuid,
        page: Page,
    ) -> AppResult<Vec<Conversation>> {
        // Each tier over-fetches so the merged slice stays complete up to
        // the requested offset.
        let fetch = Page::new(page.limit.saturating_add(page.offset.max(0)), 0);
        let mut merged = self.local.conversations_for(user_id, fetch).await?;
        merged.extend(self.cloud.conversations_for(user_id, fetch).await?);
        merged.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(merged
            .into_iter()
            .skip(page.offset.max(0) as usize)
            .take(page.limit.max(0) as usize)
            .collect())
    }

    /// Case-insensitive body substring search. A scoped search routes to
    /// the conversation's tier; an unscoped one scans the device-local
    /// tier, which is the only tier fully present on this device.
    pub async fn search_messages(
        &self,
        user_id: Uuid,
        query: &str,
        scope: Option<ConversationId>,
    ) -> AppResult<Vec<Message>> {
        match scope {
            Some(conversation_id) => {
                self.store_for(&conversation_id)
                    .search(conversation_id, query)
                    .await
            }
            None => {
                let mut hits = Vec::new();
                let conversations = self
                    .local
                    .conversations_for(user_id, Page::new(i64::MAX, 0))
                    .await?;
                for conversation in conversations {
                    hits.extend(self.local.search(conversation.id, query).await?);
                }
                Ok(hits)
            }
        }
    }

    pub async fn subscribe(
        &self,
        conversation_id: ConversationId,
    ) -> (SubscriptionId, UnboundedReceiver<MessageEvent>) {
        self.events.subscribe(conversation_id).await
    }

    pub async fn unsubscribe(&self, conversation_id: ConversationId, id: SubscriptionId) {
        self.events.unsubscribe(conversation_id, id).await
    }
}
