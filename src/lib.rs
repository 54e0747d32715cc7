//! Client-side messaging core with tiered storage.
//!
//! Conversations are classified by their id's namespace tag: regulated
//! conversations (job, admin, system) live in the shared remote ledger,
//! personal conversations live in the device-local SQLite database and are
//! replicated to an encrypted backup in the background. A single router
//! fronts both tiers and feeds every message lifecycle event into an
//! append-only, content-hashed audit ledger used for dispute resolution.
//! Presence and typing indicators are tracked in memory with TTL-based
//! expiry.

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod retry;
pub mod services;
pub mod state;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use state::{AppState, BackgroundTasks};
