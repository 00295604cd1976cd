//! Inbox / dedup store: per-service record of already-handled external
//! event IDs, enforcing idempotent at-least-once consumption.
//!
//! `seen_or_mark` must be called, and its insert committed, in the same
//! transaction as the business side effect it guards — the uniqueness
//! constraint on `event_id` is the dedup lock.

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub use postgres::PostgresInbox;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteInbox;

use async_trait::async_trait;

pub type Result<T> = std::result::Result<T, InboxError>;

#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("database error: {0}")]
    Database(String),
}

/// Outcome of [`InboxStore::seen_or_mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeenStatus {
    /// First time this event ID has been seen: proceed with side effects.
    First,
    /// Already handled: ACK and return without repeating work.
    Duplicate,
}

/// Queried by the external event ID, never the broker's internal message ID.
#[async_trait]
pub trait InboxStore: Send + Sync {
    async fn init(&self) -> Result<()>;

    /// Atomically check-and-record. Returns `Duplicate` if `event_id` was
    /// already recorded; otherwise inserts the row and returns `First`.
    async fn seen_or_mark(
        &self,
        event_id: uuid::Uuid,
        kind: &str,
        payload: &serde_json::Value,
    ) -> Result<SeenStatus>;
}
