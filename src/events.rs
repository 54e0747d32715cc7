//! In-process publish/subscribe for message mutations.
//!
//! Replaces interval polling for Personal-tier updates: every successful
//! mutation is pushed to subscribers of the affected conversation.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{ConversationId, Message};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageEvent {
    Appended {
        message: Message,
    },
    Edited {
        conversation_id: ConversationId,
        message_id: Uuid,
        new_body: String,
    },
    Deleted {
        conversation_id: ConversationId,
        message_id: Uuid,
        for_everyone: bool,
    },
    /// `emoji = None` means the reaction was removed.
    Reacted {
        conversation_id: ConversationId,
        message_id: Uuid,
        user_id: Uuid,
        emoji: Option<String>,
    },
}

impl MessageEvent {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            MessageEvent::Appended { message } => message.conversation_id,
            MessageEvent::Edited {
                conversation_id, ..
            }
            | MessageEvent::Deleted {
                conversation_id, ..
            }
            | MessageEvent::Reacted {
                conversation_id, ..
            } => *conversation_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

struct Subscriber {
    id: SubscriptionId,
    tx: UnboundedSender<MessageEvent>,
}

/// Per-conversation subscriber registry. Senders whose receiver went away
/// are pruned on the next publish; `unsubscribe` detaches immediately so a
/// resubscribe never yields duplicate deliveries.
#[derive(Default, Clone)]
pub struct MessageEventBus {
    inner: Arc<RwLock<HashMap<ConversationId, Vec<Subscriber>>>>,
}

impl MessageEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(
        &self,
        conversation_id: ConversationId,
    ) -> (SubscriptionId, UnboundedReceiver<MessageEvent>) {
        let (tx, rx) = unbounded_channel();
        let id = SubscriptionId::new();
        let mut guard = self.inner.write().await;
        guard
            .entry(conversation_id)
            .or_default()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    pub async fn unsubscribe(&self, conversation_id: ConversationId, id: SubscriptionId) {
        let mut guard = self.inner.write().await;
        if let Some(subs) = guard.get_mut(&conversation_id) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                guard.remove(&conversation_id);
            }
        }
    }

    pub async fn publish(&self, event: MessageEvent) {
        let conversation_id = event.conversation_id();
        let mut guard = self.inner.write().await;
        if let Some(subs) = guard.get_mut(&conversation_id) {
            subs.retain(|s| s.tx.send(event.clone()).is_ok());
            if subs.is_empty() {
                guard.remove(&conversation_id);
            }
        }
    }

    pub async fn subscriber_count(&self, conversation_id: ConversationId) -> usize {
        self.inner
            .read()
            .await
            .get(&conversation_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConversationKind, NewMessage};

    fn fake_message(conversation_id: ConversationId) -> Message {
        let new = NewMessage::text(conversation_id, Uuid::new_v4(), "hi");
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id: new.sender_id,
            body: new.body,
            message_type: new.message_type,
            seq: 1,
            created_at: chrono::Utc::now(),
            edited_at: None,
            deleted_at: None,
            deleted_for_everyone: false,
            reactions: vec![],
            attachments: vec![],
            reply_to: None,
            forwarded: false,
            sync_status: crate::models::SyncStatus::Pending,
        }
    }

    #[tokio::test]
    async fn unsubscribe_detaches_immediately() {
        let bus = MessageEventBus::new();
        let conversation = ConversationId::mint(ConversationKind::Personal);

        let (id, mut rx) = bus.subscribe(conversation).await;
        bus.publish(MessageEvent::Appended {
            message: fake_message(conversation),
        })
        .await;
        assert!(rx.recv().await.is_some());

        bus.unsubscribe(conversation, id).await;
        assert_eq!(bus.subscriber_count(conversation).await, 0);

        let (_id2, mut rx2) = bus.subscribe(conversation).await;
        bus.publish(MessageEvent::Appended {
            message: fake_message(conversation),
        })
        .await;
        // Old receiver is dead, new one sees exactly one event.
        assert!(rx.recv().await.is_none());
        assert!(rx2.recv().await.is_some());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned_on_publish() {
        let bus = MessageEventBus::new();
        let conversation = ConversationId::mint(ConversationKind::Personal);

        let (_id, rx) = bus.subscribe(conversation).await;
        drop(rx);
        bus.publish(MessageEvent::Appended {
            message: fake_message(conversation),
        })
        .await;
        assert_eq!(bus.subscriber_count(conversation).await, 0);
    }
}
