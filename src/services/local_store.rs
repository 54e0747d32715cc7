//! Device-local message ledger for Personal-tier conversations.
//!
//! Appends are chronological (per-conversation logical sequence, wall clock
//! as tie-break metadata), the conversation summary is updated in the same
//! transaction, and reads come from an invalidate-on-write cache backed by
//! SQLite.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::db::{from_ms, to_ms};
use crate::error::{AppError, AppResult};
use crate::models::{
    Attachment, Conversation, ConversationId, LastMessage, Message, MessageType, NewMessage,
    Reaction, SyncStatus, Tier,
};
use crate::services::store::{DeleteOutcome, EditOutcome, MessageStore, Page};

#[derive(Default)]
struct CacheInner {
    timelines: HashMap<ConversationId, Vec<Message>>,
    generations: HashMap<ConversationId, u64>,
}

/// Explicit per-process read cache with write-tied invalidation. Holds the
/// full ordered timeline of conversations that have been read recently.
///
/// Fills do not hold the lock across the SQLite load, so each conversation
/// carries a generation counter: invalidation bumps it and a fill is
/// discarded if the generation moved since the miss. A write that lands
/// mid-fill can therefore never be shadowed by the stale timeline.
#[derive(Default, Clone)]
struct ReadCache {
    inner: Arc<RwLock<CacheInner>>,
}

impl ReadCache {
    async fn get(&self, conversation_id: ConversationId) -> Option<Vec<Message>> {
        self.inner
            .read()
            .await
            .timelines
            .get(&conversation_id)
            .cloned()
    }

    /// Generation to observe before loading a fill.
    async fn generation(&self, conversation_id: ConversationId) -> u64 {
        self.inner
            .read()
            .await
            .generations
            .get(&conversation_id)
            .copied()
            .unwrap_or(0)
    }

    /// Stores a fill unless a write invalidated the conversation after
    /// `generation` was observed. A discarded fill just means the next
    /// read loads from SQLite again.
    async fn put(&self, conversation_id: ConversationId, generation: u64, messages: Vec<Message>) {
        let mut inner = self.inner.write().await;
        let current = inner
            .generations
            .get(&conversation_id)
            .copied()
            .unwrap_or(0);
        if current == generation {
            inner.timelines.insert(conversation_id, messages);
        }
    }

    async fn invalidate(&self, conversation_id: ConversationId) {
        let mut inner = self.inner.write().await;
        *inner.generations.entry(conversation_id).or_insert(0) += 1;
        inner.timelines.remove(&conversation_id);
    }
}

pub struct LocalMessageStore {
    pool: SqlitePool,
    cache: ReadCache,
    page_cap: i64,
}

/// Backup replication counters surfaced to settings/diagnostics screens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub pending: u64,
    pub failed: u64,
}

impl LocalMessageStore {
    pub fn new(pool: SqlitePool, page_cap: i64) -> Arc<Self> {
        Arc::new(Self {
            pool,
            cache: ReadCache::default(),
            page_cap,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn guard_tier(&self, conversation_id: &ConversationId) -> AppResult<()> {
        if conversation_id.tier() != Tier::Personal {
            return Err(AppError::TierMismatch {
                conversation: conversation_id.to_string(),
                expected: Tier::Personal,
                actual: conversation_id.tier(),
            });
        }
        Ok(())
    }

    async fn load_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> AppResult<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, participants, last_preview, last_sender, last_sent_at_ms, unread, \
                    created_at_ms, updated_at_ms \
             FROM conversations WHERE id = ?",
        )
        .bind(conversation_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_conversation).transpose()
    }

    async fn load_timeline(&self, conversation_id: ConversationId) -> AppResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, sender_id, seq, body, message_type, created_at_ms, \
                    edited_at_ms, deleted_at_ms, deleted_for_everyone, reactions, attachments, \
                    reply_to, forwarded, sync_status \
             FROM messages WHERE conversation_id = ? \
             ORDER BY seq ASC, created_at_ms ASC",
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    async fn get_message(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
    ) -> AppResult<Option<Message>> {
        let row = sqlx::query(
            "SELECT id, conversation_id, sender_id, seq, body, message_type, created_at_ms, \
                    edited_at_ms, deleted_at_ms, deleted_for_everyone, reactions, attachments, \
                    reply_to, forwarded, sync_status \
             FROM messages WHERE conversation_id = ? AND id = ?",
        )
        .bind(conversation_id.to_string())
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_message).transpose()
    }

    /// Oldest-first scan of messages still waiting for backup replication.
    pub async fn pending_messages(&self, limit: i64) -> AppResult<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, sender_id, seq, body, message_type, created_at_ms, \
                    edited_at_ms, deleted_at_ms, deleted_for_everyone, reactions, attachments, \
                    reply_to, forwarded, sync_status \
             FROM messages WHERE sync_status = 'pending' \
             ORDER BY created_at_ms ASC LIMIT ?",
        )
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    /// pending -> synced. Guarded so the status can only advance; returns
    /// false when the message was no longer pending.
    pub async fn mark_synced(&self, message_id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE messages SET sync_status = 'synced' \
             WHERE id = ? AND sync_status = 'pending'",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Bumps the attempt counter; flips pending -> failed once the budget is
    /// exhausted. Never demotes a message that already synced.
    pub async fn record_sync_failure(&self, message_id: Uuid, max_attempts: u32) -> AppResult<()> {
        sqlx::query(
            "UPDATE messages SET \
                sync_attempts = sync_attempts + 1, \
                sync_status = CASE WHEN sync_attempts + 1 >= ? THEN 'failed' ELSE 'pending' END \
             WHERE id = ? AND sync_status = 'pending'",
        )
        .bind(max_attempts as i64)
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// User-driven retry: failed messages go back into the pending scan.
    pub async fn retry_failed(&self) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE messages SET sync_status = 'pending', sync_attempts = 0 \
             WHERE sync_status = 'failed'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn sync_stats(&self) -> AppResult<SyncStats> {
        let row = sqlx::query(
            "SELECT \
                SUM(CASE WHEN sync_status = 'pending' THEN 1 ELSE 0 END) AS pending, \
                SUM(CASE WHEN sync_status = 'failed' THEN 1 ELSE 0 END) AS failed \
             FROM messages",
        )
        .fetch_one(&self.pool)
        .await?;
        let pending: Option<i64> = row.get("pending");
        let failed: Option<i64> = row.get("failed");
        Ok(SyncStats {
            pending: pending.unwrap_or(0) as u64,
            failed: failed.unwrap_or(0) as u64,
        })
    }
}

#[async_trait]
impl MessageStore for LocalMessageStore {
    fn tier(&self) -> Tier {
        Tier::Personal
    }

    async fn append(&self, new: NewMessage) -> AppResult<Message> {
        self.guard_tier(&new.conversation_id)?;
        let conversation_key = new.conversation_id.to_string();
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        // Lazily create the conversation on first message.
        let existing = sqlx::query("SELECT participants, unread FROM conversations WHERE id = ?")
            .bind(&conversation_key)
            .fetch_optional(&mut *tx)
            .await?;

        let (participants, mut unread) = match &existing {
            Some(row) => {
                let participants: Vec<Uuid> = serde_json::from_str(row.get("participants"))?;
                let unread: HashMap<Uuid, u32> = serde_json::from_str(row.get("unread"))?;
                (participants, unread)
            }
            None => {
                let mut participants = vec![new.sender_id];
                for r in &new.recipients {
                    if !participants.contains(r) {
                        participants.push(*r);
                    }
                }
                (participants, HashMap::new())
            }
        };

        let seq: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?")
                .bind(&conversation_key)
                .fetch_one(&mut *tx)
                .await?;

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            body: new.body.clone(),
            message_type: new.message_type,
            seq,
            created_at: now,
            edited_at: None,
            deleted_at: None,
            deleted_for_everyone: false,
            reactions: Vec::new(),
            attachments: new.attachments.clone(),
            reply_to: new.reply_to,
            forwarded: new.forwarded,
            sync_status: SyncStatus::Pending,
        };

        sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender_id, seq, body, message_type, \
                created_at_ms, reactions, attachments, reply_to, forwarded, sync_status) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending')",
        )
        .bind(message.id)
        .bind(&conversation_key)
        .bind(message.sender_id)
        .bind(message.seq)
        .bind(&message.body)
        .bind(message.message_type.as_str())
        .bind(to_ms(message.created_at))
        .bind(serde_json::to_string(&message.reactions)?)
        .bind(serde_json::to_string(&message.attachments)?)
        .bind(message.reply_to)
        .bind(message.forwarded)
        .execute(&mut *tx)
        .await?;

        // Summary update rides the same transaction as the insert.
        for participant in &participants {
            if *participant != new.sender_id {
                *unread.entry(*participant).or_insert(0) += 1;
            }
        }
        let preview = LastMessage::preview_of(&message.body);

        if existing.is_some() {
            sqlx::query(
                "UPDATE conversations SET last_preview = ?, last_sender = ?, last_sent_at_ms = ?, \
                    unread = ?, updated_at_ms = ? WHERE id = ?",
            )
            .bind(&preview)
            .bind(message.sender_id)
            .bind(to_ms(now))
            .bind(serde_json::to_string(&unread)?)
            .bind(to_ms(now))
            .bind(&conversation_key)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "INSERT INTO conversations (id, kind, participants, last_preview, last_sender, \
                    last_sent_at_ms, unread, created_at_ms, updated_at_ms) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&conversation_key)
            .bind(new.conversation_id.kind.tag())
            .bind(serde_json::to_string(&participants)?)
            .bind(&preview)
            .bind(message.sender_id)
            .bind(to_ms(now))
            .bind(serde_json::to_string(&unread)?)
            .bind(to_ms(now))
            .bind(to_ms(now))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.cache.invalidate(new.conversation_id).await;
        Ok(message)
    }

    async fn read(&self, conversation_id: ConversationId, page: Page) -> AppResult<Vec<Message>> {
        let page = page.clamped(self.page_cap);

        let timeline = match self.cache.get(conversation_id).await {
            Some(cached) => cached,
            None => {
                let generation = self.cache.generation(conversation_id).await;
                match self.load_timeline(conversation_id).await {
                    Ok(loaded) => {
                        self.cache
                            .put(conversation_id, generation, loaded.clone())
                            .await;
                        loaded
                    }
                    Err(e) => {
                        // Reads degrade to empty rather than crashing a view.
                        warn!(conversation = %conversation_id, error = %e, "local read failed");
                        return Ok(Vec::new());
                    }
                }
            }
        };

        let start = (page.offset as usize).min(timeline.len());
        let end = (start + page.limit as usize).min(timeline.len());
        Ok(timeline[start..end].to_vec())
    }

    async fn get(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
    ) -> AppResult<Option<Message>> {
        self.get_message(conversation_id, message_id).await
    }

    async fn edit(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        new_body: &str,
    ) -> AppResult<EditOutcome> {
        let current = self
            .get_message(conversation_id, message_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;
        if current.deleted_for_everyone {
            return Err(AppError::AlreadyDeleted);
        }

        let edited_at = Utc::now();
        sqlx::query("UPDATE messages SET body = ?, edited_at_ms = ? WHERE id = ?")
            .bind(new_body)
            .bind(to_ms(edited_at))
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        self.cache.invalidate(conversation_id).await;

        let mut message = current.clone();
        message.body = new_body.to_string();
        message.edited_at = Some(edited_at);
        Ok(EditOutcome {
            previous_body: current.body,
            message,
        })
    }

    async fn delete(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        for_everyone: bool,
    ) -> AppResult<DeleteOutcome> {
        let current = self
            .get_message(conversation_id, message_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;
        if current.deleted_for_everyone {
            return Err(AppError::AlreadyDeleted);
        }

        // Rewrite in place: the live body is gone for good, only the audit
        // trail keeps the original text.
        let deleted_at = Utc::now();
        sqlx::query(
            "UPDATE messages SET body = '', deleted_at_ms = ?, deleted_for_everyone = ? \
             WHERE id = ?",
        )
        .bind(to_ms(deleted_at))
        .bind(for_everyone)
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        self.cache.invalidate(conversation_id).await;

        let mut message = current.clone();
        message.body = String::new();
        message.deleted_at = Some(deleted_at);
        message.deleted_for_everyone = for_everyone;
        Ok(DeleteOutcome {
            original_body: current.body,
            message,
        })
    }

    async fn set_reaction(
        &self,
        conversation_id: ConversationId,
        message_id: Uuid,
        user_id: Uuid,
        emoji: Option<&str>,
    ) -> AppResult<Message> {
        let mut current = self
            .get_message(conversation_id, message_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;
        if current.is_deleted() {
            return Err(AppError::AlreadyDeleted);
        }

        current.reactions.retain(|r| r.user_id != user_id);
        if let Some(emoji) = emoji {
            current.reactions.push(Reaction {
                emoji: emoji.to_string(),
                user_id,
                reacted_at: Utc::now(),
            });
        }

        sqlx::query("UPDATE messages SET reactions = ? WHERE id = ?")
            .bind(serde_json::to_string(&current.reactions)?)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        self.cache.invalidate(conversation_id).await;
        Ok(current)
    }

    async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> AppResult<Option<Conversation>> {
        self.load_conversation(conversation_id).await
    }

    async fn conversations_for(
        &self,
        user_id: Uuid,
        page: Page,
    ) -> AppResult<Vec<Conversation>> {
        let page = page.clamped(self.page_cap);
        let rows = sqlx::query(
            "SELECT id, participants, last_preview, last_sender, last_sent_at_ms, unread, \
                    created_at_ms, updated_at_ms \
             FROM conversations ORDER BY updated_at_ms DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        // Membership lives in a JSON column; filter after mapping. The
        // device ledger stays small enough for a full scan.
        let conversations = rows
            .into_iter()
            .map(row_to_conversation)
            .collect::<AppResult<Vec<_>>>()?;
        Ok(conversations
            .into_iter()
            .filter(|c| c.is_participant(user_id))
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
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
        // Scans the same timeline the read path serves, cached or not.
        let timeline = match self.cache.get(conversation_id).await {
            Some(cached) => cached,
            None => self.load_timeline(conversation_id).await?,
        };
        Ok(timeline
            .into_iter()
            .filter(|m| !m.is_deleted() && m.body.to_lowercase().contains(&needle))
            .collect())
    }

    async fn mark_read(&self, conversation_id: ConversationId, user_id: Uuid) -> AppResult<()> {
        // No-op for a conversation this device has never seen, matching the
        // remote ledger: marking read is idempotent on both tiers.
        let Some(mut conversation) = self.load_conversation(conversation_id).await? else {
            return Ok(());
        };
        conversation.unread.insert(user_id, 0);
        sqlx::query("UPDATE conversations SET unread = ? WHERE id = ?")
            .bind(serde_json::to_string(&conversation.unread)?)
            .bind(conversation_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_message(row: sqlx::sqlite::SqliteRow) -> AppResult<Message> {
    let conversation_raw: String = row.get("conversation_id");
    let conversation_id: ConversationId = conversation_raw.parse()?;

    let type_raw: String = row.get("message_type");
    let message_type = MessageType::parse(&type_raw)
        .ok_or_else(|| AppError::Validation(format!("unknown message type {type_raw:?}")))?;

    let status_raw: String = row.get("sync_status");
    let sync_status = SyncStatus::parse(&status_raw)
        .ok_or_else(|| AppError::Validation(format!("unknown sync status {status_raw:?}")))?;

    let reactions: Vec<Reaction> = serde_json::from_str(row.get("reactions"))?;
    let attachments: Vec<Attachment> = serde_json::from_str(row.get("attachments"))?;

    let edited_at_ms: Option<i64> = row.get("edited_at_ms");
    let deleted_at_ms: Option<i64> = row.get("deleted_at_ms");

    Ok(Message {
        id: row.get("id"),
        conversation_id,
        sender_id: row.get("sender_id"),
        body: row.get("body"),
        message_type,
        seq: row.get("seq"),
        created_at: from_ms(row.get("created_at_ms")),
        edited_at: edited_at_ms.map(from_ms),
        deleted_at: deleted_at_ms.map(from_ms),
        deleted_for_everyone: row.get("deleted_for_everyone"),
        reactions,
        attachments,
        reply_to: row.get("reply_to"),
        forwarded: row.get("forwarded"),
        sync_status,
    })
}

fn row_to_conversation(row: sqlx::sqlite::SqliteRow) -> AppResult<Conversation> {
    let id_raw: String = row.get("id");
    let id: ConversationId = id_raw.parse()?;
    let participants: Vec<Uuid> = serde_json::from_str(row.get("participants"))?;
    let unread: HashMap<Uuid, u32> = serde_json::from_str(row.get("unread"))?;

    let last_preview: Option<String> = row.get("last_preview");
    let last_sender: Option<Uuid> = row.get("last_sender");
    let last_sent_at_ms: Option<i64> = row.get("last_sent_at_ms");
    let last_message = match (last_preview, last_sender, last_sent_at_ms) {
        (Some(preview), Some(sender_id), Some(ms)) => Some(LastMessage {
            preview,
            sender_id,
            sent_at: from_ms(ms),
        }),
        _ => None,
    };

    Ok(Conversation {
        id,
        participants,
        last_message,
        unread,
        created_at: from_ms(row.get("created_at_ms")),
        updated_at: from_ms(row.get("updated_at_ms")),
    })
}
