//! Append-only, content-hashed ledger of message lifecycle events.
//!
//! Every create/edit/delete on a message lands here with the SHA-256 of its
//! payload, so pre-edit and pre-delete content survives in exactly one
//! place. Entries are only ever inserted; readers recompute the hash and
//! refuse to serve tampered rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use uuid::Uuid;

use crate::db::{from_ms, to_ms};
use crate::error::{AppError, AppResult};
use crate::models::{
    Attachment, AttachmentDigest, AuditEntry, AuditEvent, AuditPayload, ConversationId,
    DisputeReport, ReportRange,
};
use crate::retry::{with_retry_if, RetryConfig};

pub struct DisputeAuditTrail {
    pool: SqlitePool,
    device_fingerprint: String,
}

impl DisputeAuditTrail {
    pub fn new(pool: SqlitePool, device_fingerprint: String) -> Arc<Self> {
        Arc::new(Self {
            pool,
            device_fingerprint,
        })
    }

    /// Records a message creation. Also writes the head row that later
    /// edit/delete entries use to resolve the conversation and that carries
    /// the aggregate deleted flag.
    pub async fn record_create(
        &self,
        message_id: Uuid,
        conversation_id: ConversationId,
        sender_id: Uuid,
        recipient_ids: Vec<Uuid>,
        content: String,
        attachments: &[Attachment],
    ) -> AppResult<AuditEntry> {
        let payload = AuditPayload::Created {
            content,
            recipient_ids,
            attachments: attachments.iter().map(AttachmentDigest::of).collect(),
        };
        let now = Utc::now();

        sqlx::query(
            "INSERT OR IGNORE INTO audit_messages (message_id, conversation_id, is_deleted, created_at_ms)
             VALUES (?1, ?2, 0, ?3)",
        )
        .bind(message_id)
        .bind(conversation_id.to_string())
        .bind(to_ms(now))
        .execute(&self.pool)
        .await?;

        self.insert_entry(message_id, conversation_id, sender_id, payload, now)
            .await
    }

    /// Records an edit, preserving the pre-edit content.
    pub async fn record_edit(
        &self,
        message_id: Uuid,
        editor_id: Uuid,
        old_content: String,
        new_content: String,
        reason: Option<String>,
    ) -> AppResult<AuditEntry> {
        let conversation_id = self.head_conversation(message_id).await?;
        let payload = AuditPayload::Edited {
            old_content,
            new_content,
            reason,
        };
        self.insert_entry(message_id, conversation_id, editor_id, payload, Utc::now())
            .await
    }

    /// Records a deletion, preserving the original content and flipping the
    /// head row's aggregate deleted flag.
    pub async fn record_delete(
        &self,
        message_id: Uuid,
        deleter_id: Uuid,
        original_content: String,
        soft_delete: bool,
        reason: Option<String>,
    ) -> AppResult<AuditEntry> {
        let conversation_id = self.head_conversation(message_id).await?;
        let payload = AuditPayload::Deleted {
            original_content,
            soft_delete,
            reason,
        };
        let entry = self
            .insert_entry(message_id, conversation_id, deleter_id, payload, Utc::now())
            .await?;

        sqlx::query("UPDATE audit_messages SET is_deleted = 1 WHERE message_id = ?1")
            .bind(message_id)
            .execute(&self.pool)
            .await?;

        Ok(entry)
    }

    /// Dispatches one lifecycle event to the matching recorder.
    pub async fn apply(&self, event: AuditEvent) -> AppResult<AuditEntry> {
        match event {
            AuditEvent::MessageCreated {
                message_id,
                conversation_id,
                sender_id,
                recipient_ids,
                content,
                attachments,
            } => {
                self.record_create(
                    message_id,
                    conversation_id,
                    sender_id,
                    recipient_ids,
                    content,
                    &attachments,
                )
                .await
            }
            AuditEvent::MessageEdited {
                message_id,
                editor_id,
                old_content,
                new_content,
                reason,
            } => {
                self.record_edit(message_id, editor_id, old_content, new_content, reason)
                    .await
            }
            AuditEvent::MessageDeleted {
                message_id,
                deleter_id,
                original_content,
                soft_delete,
                reason,
            } => {
                self.record_delete(message_id, deleter_id, original_content, soft_delete, reason)
                    .await
            }
        }
    }

    /// Full lifecycle of one message, oldest first. Every entry's hash is
    /// recomputed before it is returned.
    pub async fn get_history(&self, message_id: Uuid) -> AppResult<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT id, message_id, conversation_id, event_type, actor_id, content_hash,
                    device_fingerprint, recorded_at_ms, payload
             FROM audit_entries
             WHERE message_id = ?1
             ORDER BY recorded_at_ms ASC, rowid ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| self.row_to_entry(row)).collect()
    }

    /// Every entry for a conversation within the (optional) time range,
    /// packaged for handoff to external compliance tooling.
    pub async fn export_for_dispute(
        &self,
        conversation_id: ConversationId,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> AppResult<DisputeReport> {
        let rows = sqlx::query(
            "SELECT id, message_id, conversation_id, event_type, actor_id, content_hash,
                    device_fingerprint, recorded_at_ms, payload
             FROM audit_entries
             WHERE conversation_id = ?1
               AND (?2 IS NULL OR recorded_at_ms >= ?2)
               AND (?3 IS NULL OR recorded_at_ms <= ?3)
             ORDER BY recorded_at_ms ASC, rowid ASC",
        )
        .bind(conversation_id.to_string())
        .bind(start.map(to_ms))
        .bind(end.map(to_ms))
        .fetch_all(&self.pool)
        .await?;

        let entries: Vec<AuditEntry> = rows
            .iter()
            .map(|row| self.row_to_entry(row))
            .collect::<AppResult<_>>()?;

        Ok(DisputeReport {
            conversation_id,
            exported_at: Utc::now(),
            range: ReportRange { start, end },
            total_entries: entries.len(),
            entries,
        })
    }

    /// Aggregate deleted flag from the head row. Unknown messages read as
    /// not deleted.
    pub async fn is_deleted(&self, message_id: Uuid) -> AppResult<bool> {
        let row = sqlx::query("SELECT is_deleted FROM audit_messages WHERE message_id = ?1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("is_deleted") != 0).unwrap_or(false))
    }

    async fn head_conversation(&self, message_id: Uuid) -> AppResult<ConversationId> {
        let row = sqlx::query("SELECT conversation_id FROM audit_messages WHERE message_id = ?1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no audit head for message {message_id}")))?;
        let raw: String = row.get("conversation_id");
        raw.parse()
    }

    async fn insert_entry(
        &self,
        message_id: Uuid,
        conversation_id: ConversationId,
        actor_id: Uuid,
        payload: AuditPayload,
        recorded_at: DateTime<Utc>,
    ) -> AppResult<AuditEntry> {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            message_id,
            conversation_id,
            event_type: payload.event_type(),
            actor_id,
            content_hash: payload.hash()?,
            device_fingerprint: self.device_fingerprint.clone(),
            recorded_at,
            payload,
        };

        sqlx::query(
            "INSERT INTO audit_entries
                 (id, message_id, conversation_id, event_type, actor_id, content_hash,
                  device_fingerprint, recorded_at_ms, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(entry.id)
        .bind(entry.message_id)
        .bind(entry.conversation_id.to_string())
        .bind(entry.event_type.as_str())
        .bind(entry.actor_id)
        .bind(&entry.content_hash)
        .bind(&entry.device_fingerprint)
        .bind(to_ms(entry.recorded_at))
        .bind(serde_json::to_string(&entry.payload)?)
        .execute(&self.pool)
        .await?;

        debug!(
            message_id = %entry.message_id,
            event_type = entry.event_type.as_str(),
            "audit entry recorded"
        );
        Ok(entry)
    }

    fn row_to_entry(&self, row: &sqlx::sqlite::SqliteRow) -> AppResult<AuditEntry> {
        let message_id: Uuid = row.get("message_id");
        let raw_conversation: String = row.get("conversation_id");
        let raw_event: String = row.get("event_type");
        let event_type = crate::models::AuditEventType::parse(&raw_event).ok_or_else(|| {
            AppError::Validation(format!("unknown audit event type {raw_event:?}"))
        })?;
        let payload: AuditPayload = serde_json::from_str(row.get("payload"))?;
        let stored: String = row.get("content_hash");

        let computed = payload.hash()?;
        if computed != stored {
            return Err(AppError::Integrity {
                message_id,
                stored,
                computed,
            });
        }

        Ok(AuditEntry {
            id: row.get("id"),
            message_id,
            conversation_id: raw_conversation.parse()?,
            event_type,
            actor_id: row.get("actor_id"),
            content_hash: stored,
            device_fingerprint: row.get("device_fingerprint"),
            recorded_at: from_ms(row.get("recorded_at_ms")),
            payload,
        })
    }
}

/// Fire-and-forget handle the router records lifecycle events through.
/// Losing the worker downgrades auditing to an error log; it never fails
/// the user-facing operation.
#[derive(Clone)]
pub struct AuditSink {
    tx: UnboundedSender<AuditEvent>,
}

impl AuditSink {
    pub fn record(&self, event: AuditEvent) {
        if self.tx.send(event).is_err() {
            error!("audit worker is gone; lifecycle event dropped");
        }
    }
}

/// Spawns the background task that drains the sink into the ledger,
/// retrying transient database errors.
pub fn spawn_audit_worker(
    trail: Arc<DisputeAuditTrail>,
    retry: RetryConfig,
) -> (AuditSink, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<AuditEvent>();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let result = with_retry_if(
                &retry,
                || {
                    let trail = trail.clone();
                    let event = event.clone();
                    async move { trail.apply(event).await }
                },
                |err| err.is_retryable(),
            )
            .await;
            if let Err(err) = result {
                error!(error = %err, "failed to record audit entry");
            }
        }
    });
    (AuditSink { tx }, task)
}
