//! Transactional outbox engine.
//!
//! A service emitting a domain event inserts a row into its outbox table in
//! the *same local transaction* as the state change that produced the
//! event. A background [`drainer`] polls for unpublished rows, publishes
//! them to the event bus, and marks them processed in a separate
//! transaction. If the process crashes between publish and mark, the row is
//! republished on the next tick — downstream consumers deduplicate via the
//! inbox.
//!
//! Only Postgres and SQLite backends are provided, selected at compile time
//! via the `postgres`/`sqlite` features.

pub mod drainer;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use drainer::{spawn_drainer, DrainerConfig, DrainerHandle};
#[cfg(feature = "postgres")]
pub use postgres::PostgresOutbox;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteOutbox;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, OutboxError>;

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A row pending insertion, supplied by the producing business transaction.
#[derive(Debug, Clone)]
pub struct NewOutboxRow {
    pub kind: String,
    pub payload: Value,
    pub topic: String,
}

impl NewOutboxRow {
    /// Partition key used by the drainer when publishing: the payload's
    /// `aggregate_id` field if present, otherwise the event kind. Producers
    /// are expected to include `aggregate_id` in the payload for anything
    /// that needs per-aggregate ordering.
    pub fn partition_key(&self) -> String {
        self.payload
            .get("aggregate_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.kind.clone())
    }
}

/// A persisted outbox row.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: Uuid,
    pub kind: String,
    pub payload: Value,
    pub topic: String,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxRow {
    pub fn partition_key(&self) -> String {
        self.payload
            .get("aggregate_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.kind.clone())
    }
}

/// Counts of total/processed/pending rows, and a per-kind breakdown.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct OutboxStats {
    pub total: i64,
    pub processed: i64,
    pub pending: i64,
    pub by_kind: std::collections::HashMap<String, i64>,
}

/// Drainer-facing capability: select pending rows in commit order, mark a
/// row processed. Insertion is backend-specific (it must run inside the
/// producer's own transaction) and is exposed as an inherent method on each
/// concrete store rather than through this object-safe trait.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Create the outbox table and supporting indexes if absent.
    async fn init(&self) -> Result<()>;

    /// Select up to `batch_size` unprocessed rows ordered by `created_at`.
    async fn select_pending(&self, batch_size: u32) -> Result<Vec<OutboxRow>>;

    /// Mark a row processed. Idempotent: marking an already-processed row
    /// (e.g. a racing drainer) is not an error.
    async fn mark_processed(&self, id: Uuid, processed_at: DateTime<Utc>) -> Result<()>;

    async fn stats(&self) -> Result<OutboxStats>;

    /// Insert a row in its own standalone transaction. Used by callers with
    /// no pre-existing transaction to join — e.g. the saga engine
    /// emitting its own progress events against its own `saga_log` table,
    /// as opposed to a participant service emitting domain events atomically
    /// with its own business-state write via the backend-specific
    /// `insert_in_tx`.
    async fn insert_standalone(&self, row: NewOutboxRow) -> Result<Uuid>;
}
