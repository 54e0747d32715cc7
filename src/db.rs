//! Device-local SQLite database: message ledger, conversation summaries and
//! the append-only audit ledger.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::AppResult;

pub async fn connect(url: &str) -> AppResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
    // A single connection keeps in-memory databases alive and serializes
    // writers; the device database has one authoring process anyway.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Startup DDL, idempotent.
pub async fn bootstrap(pool: &SqlitePool) -> AppResult<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            participants TEXT NOT NULL,
            last_preview TEXT,
            last_sender BLOB,
            last_sent_at_ms INTEGER,
            unread TEXT NOT NULL DEFAULT '{}',
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS messages (
            id BLOB PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            sender_id BLOB NOT NULL,
            seq INTEGER NOT NULL,
            body TEXT NOT NULL,
            message_type TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            edited_at_ms INTEGER,
            deleted_at_ms INTEGER,
            deleted_for_everyone INTEGER NOT NULL DEFAULT 0,
            reactions TEXT NOT NULL DEFAULT '[]',
            attachments TEXT NOT NULL DEFAULT '[]',
            reply_to BLOB,
            forwarded INTEGER NOT NULL DEFAULT 0,
            sync_status TEXT NOT NULL DEFAULT 'pending',
            sync_attempts INTEGER NOT NULL DEFAULT 0
        )",
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq
            ON messages (conversation_id, seq)",
        "CREATE INDEX IF NOT EXISTS idx_messages_sync_status
            ON messages (sync_status, created_at_ms)",
        "CREATE TABLE IF NOT EXISTS audit_messages (
            message_id BLOB PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS audit_entries (
            id BLOB PRIMARY KEY,
            message_id BLOB NOT NULL,
            conversation_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            actor_id BLOB NOT NULL,
            content_hash TEXT NOT NULL,
            device_fingerprint TEXT NOT NULL,
            recorded_at_ms INTEGER NOT NULL,
            payload TEXT NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_audit_entries_message
            ON audit_entries (message_id, recorded_at_ms)",
        "CREATE INDEX IF NOT EXISTS idx_audit_entries_conversation
            ON audit_entries (conversation_id, recorded_at_ms)",
    ];

    for sql in statements {
        sqlx::query(sql).execute(pool).await?;
    }
    Ok(())
}

/// Timestamps are persisted as unix milliseconds for stable ordering.
pub(crate) fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
