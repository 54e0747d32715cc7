use thiserror::Error;
use uuid::Uuid;

use crate::models::Tier;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("transient i/o error: {0}")]
    TransientIo(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("message already deleted for everyone")]
    AlreadyDeleted,

    #[error("conversation {conversation} is {actual:?} tier, store only accepts {expected:?}")]
    TierMismatch {
        conversation: String,
        expected: Tier,
        actual: Tier,
    },

    #[error("audit integrity violation for message {message_id}: stored hash {stored} != computed {computed}")]
    Integrity {
        message_id: Uuid,
        stored: String,
        computed: String,
    },
}

impl AppError {
    /// Whether a retry with backoff has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::TransientIo(_) => true,
            AppError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }
}
