use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use guild_chat_core::config::Config;
use guild_chat_core::db;
use guild_chat_core::error::{AppError, AppResult};
use guild_chat_core::models::{
    Conversation, ConversationId, ConversationKind, Message, NewMessage, SyncStatus,
};
use guild_chat_core::services::local_store::LocalMessageStore;
use guild_chat_core::services::store::{
    DeleteOutcome, EditOutcome, InMemoryRemoteLedger, MessageStore, Page, RemoteLedger,
};
use guild_chat_core::services::sync::SyncCoordinator;
use uuid::Uuid;

/// Backup target whose push path can be switched off to simulate an
/// unreachable service. Everything else delegates to the in-memory ledger.
struct FlakyBackup {
    inner: InMemoryRemoteLedger,
    healthy: AtomicBool,
}

impl FlakyBackup {
    fn new(healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryRemoteLedger::new(),
            healthy: AtomicBool::new(healthy),
        })
    }

    fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteLedger for FlakyBackup {
    async fn append(&self, new: NewMessage) -> AppResult<Message> {
        self.inner.append(new).await
    }

    async fn read(&self, conversation_id: ConversationId, page: Page) -> AppResult<Vec<Message>> {
        self.inner.read(conversation_id, page).await
    }

    async fn get(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
    ) -> AppResult<Option<Message>> {
        self.inner.get(conversation_id, message_id).await
    }

    async fn edit(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        new_body: &str,
    ) -> AppResult<EditOutcome> {
        self.inner.edit(conversation_id, message_id, new_body).await
    }

    async fn delete(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        for_everyone: bool,
    ) -> AppResult<DeleteOutcome> {
        self.inner.delete(conversation_id, message_id, for_everyone).await
    }

    async fn set_reaction(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        user_id: Uuid,
        emoji: Option<&str>,
    ) -> AppResult<Message> {
        self.inner
            .set_reaction(conversation_id, message_id, user_id, emoji)
            .await
    }

    async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> AppResult<Option<Conversation>> {
        self.inner.conversation(conversation_id).await
    }

    async fn conversations_for(
        &self,
        user_id: Uuid,
        page: Page,
    ) -> AppResult<Vec<Conversation>> {
        self.inner.conversations_for(user_id, page).await
    }

    async fn search(
        &self,
        conversation_id: ConversationId,
        query: &str,
    ) -> AppResult<Vec<Message>> {
        self.inner.search(conversation_id, query).await
    }

    async fn mark_read(&self, conversation_id: ConversationId, user_id: Uuid) -> AppResult<()> {
        self.inner.mark_read(conversation_id, user_id).await
    }

    async fn backup(&self, message: &Message) -> AppResult<()> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(AppError::TransientIo("backup target unreachable".into()));
        }
        self.inner.backup(message).await
    }
}

async fn local() -> Arc<LocalMessageStore> {
    let pool = db::connect("sqlite::memory:").await.unwrap();
    db::bootstrap(&pool).await.unwrap();
    LocalMessageStore::new(pool, 200)
}

fn config(max_attempts: u32) -> Config {
    Config {
        sync_max_attempts: max_attempts,
        ..Config::default()
    }
}

#[tokio::test]
async fn run_once_replicates_pending_messages() {
    let store = local().await;
    let backup = FlakyBackup::new(true);
    let coordinator = SyncCoordinator::new(store.clone(), Some(backup.clone()), &config(5));

    let conversation = ConversationId::mint(ConversationKind::Personal);
    let sender = Uuid::new_v4();
    let a = store
        .append(NewMessage::text(conversation, sender, "a"))
        .await
        .unwrap();
    let b = store
        .append(NewMessage::text(conversation, sender, "b"))
        .await
        .unwrap();

    let report = coordinator.run_once().await.unwrap();
    assert_eq!(report.synced, 2);
    assert_eq!(report.failed_attempts, 0);

    for id in [a.id, b.id] {
        let backed = backup.inner.backed_up(id).await.unwrap();
        assert_eq!(backed.id, id);
        let live = store.get(conversation, id).await.unwrap().unwrap();
        assert_eq!(live.sync_status, SyncStatus::Synced);
    }

    // A second pass finds nothing to do.
    assert_eq!(coordinator.run_once().await.unwrap().synced, 0);
}

#[tokio::test]
async fn backup_preserves_local_ordering_metadata() {
    let store = local().await;
    let backup = FlakyBackup::new(true);
    let coordinator = SyncCoordinator::new(store.clone(), Some(backup.clone()), &config(5));

    let conversation = ConversationId::mint(ConversationKind::Personal);
    let sender = Uuid::new_v4();
    let original = store
        .append(NewMessage::text(conversation, sender, "ordered"))
        .await
        .unwrap();

    coordinator.run_once().await.unwrap();
    let backed = backup.inner.backed_up(original.id).await.unwrap();
    assert_eq!(backed.seq, original.seq);
    // Timestamps persist at millisecond resolution.
    assert_eq!(
        backed.created_at.timestamp_millis(),
        original.created_at.timestamp_millis()
    );
}

#[tokio::test]
async fn exhausted_attempts_move_a_message_to_failed() {
    let store = local().await;
    let backup = FlakyBackup::new(false);
    let coordinator = SyncCoordinator::new(store.clone(), Some(backup.clone()), &config(2));

    let conversation = ConversationId::mint(ConversationKind::Personal);
    let sender = Uuid::new_v4();
    let message = store
        .append(NewMessage::text(conversation, sender, "unlucky"))
        .await
        .unwrap();

    // First failed pass: still pending.
    assert_eq!(coordinator.run_once().await.unwrap().failed_attempts, 1);
    let live = store.get(conversation, message.id).await.unwrap().unwrap();
    assert_eq!(live.sync_status, SyncStatus::Pending);

    // Second failed pass exhausts the budget.
    assert_eq!(coordinator.run_once().await.unwrap().failed_attempts, 1);
    let live = store.get(conversation, message.id).await.unwrap().unwrap();
    assert_eq!(live.sync_status, SyncStatus::Failed);

    // Failed messages are off the scan; the local timeline still serves them.
    assert_eq!(coordinator.run_once().await.unwrap().failed_attempts, 0);
    assert_eq!(store.read(conversation, Page::default()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn retry_failed_requeues_for_the_next_pass() {
    let store = local().await;
    let backup = FlakyBackup::new(false);
    let coordinator = SyncCoordinator::new(store.clone(), Some(backup.clone()), &config(1));

    let conversation = ConversationId::mint(ConversationKind::Personal);
    let sender = Uuid::new_v4();
    let message = store
        .append(NewMessage::text(conversation, sender, "second chance"))
        .await
        .unwrap();

    coordinator.run_once().await.unwrap();
    let live = store.get(conversation, message.id).await.unwrap().unwrap();
    assert_eq!(live.sync_status, SyncStatus::Failed);

    // Target recovers, user hits "retry".
    backup.set_healthy(true);
    assert_eq!(store.retry_failed().await.unwrap(), 1);
    assert_eq!(coordinator.run_once().await.unwrap().synced, 1);
    let live = store.get(conversation, message.id).await.unwrap().unwrap();
    assert_eq!(live.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn without_a_backup_target_the_pass_is_a_no_op() {
    let store = local().await;
    let coordinator = SyncCoordinator::new(store.clone(), None, &config(3));

    let conversation = ConversationId::mint(ConversationKind::Personal);
    store
        .append(NewMessage::text(conversation, Uuid::new_v4(), "offline only"))
        .await
        .unwrap();

    let report = coordinator.run_once().await.unwrap();
    assert_eq!(report.synced, 0);
    assert_eq!(report.failed_attempts, 0);
}
