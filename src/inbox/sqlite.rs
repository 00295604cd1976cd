//! SQLite-backed inbox store.

use async_trait::async_trait;
use chrono::Utc;
use sea_query::{ColumnDef, Iden, SqliteQueryBuilder, Table};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{InboxError, InboxStore, Result, SeenStatus};

#[derive(Iden)]
enum Inbox {
    Table,
    EventId,
    Kind,
    Payload,
    ProcessedAt,
}

pub struct SqliteInbox {
    pool: SqlitePool,
    table_name: String,
}

impl SqliteInbox {
    pub fn new(pool: SqlitePool, table_name: impl Into<String>) -> Self {
        Self {
            pool,
            table_name: table_name.into(),
        }
    }
}

#[async_trait]
impl InboxStore for SqliteInbox {
    async fn init(&self) -> Result<()> {
        let create = Table::create()
            .table(Inbox::Table)
            .if_not_exists()
            .col(ColumnDef::new(Inbox::EventId).text().primary_key())
            .col(ColumnDef::new(Inbox::Kind).text().not_null())
            .col(ColumnDef::new(Inbox::Payload).text().not_null())
            .col(ColumnDef::new(Inbox::ProcessedAt).text().not_null())
            .to_string(SqliteQueryBuilder)
            .replace("\"inbox\"", &self.table_name);

        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .map_err(|e| InboxError::Database(e.to_string()))?;

        Ok(())
    }

    async fn seen_or_mark(
        &self,
        event_id: Uuid,
        kind: &str,
        payload: &serde_json::Value,
    ) -> Result<SeenStatus> {
        let result = sqlx::query(&format!(
            "INSERT INTO {} (event_id, kind, payload, processed_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT (event_id) DO NOTHING",
            self.table_name
        ))
        .bind(event_id.to_string())
        .bind(kind)
        .bind(payload.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| InboxError::Database(e.to_string()))?;

        Ok(if result.rows_affected() == 1 {
            SeenStatus::First
        } else {
            SeenStatus::Duplicate
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> SqliteInbox {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteInbox::new(pool, "inbox".to_string());
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn first_delivery_then_duplicate() {
        let store = test_store().await;
        let event_id = Uuid::new_v4();
        let payload = serde_json::json!({"payment_id": "p-1"});

        let first = store.seen_or_mark(event_id, "PaymentCompleted", &payload).await.unwrap();
        assert_eq!(first, SeenStatus::First);

        let second = store.seen_or_mark(event_id, "PaymentCompleted", &payload).await.unwrap();
        assert_eq!(second, SeenStatus::Duplicate);
    }

    #[tokio::test]
    async fn distinct_event_ids_are_both_first() {
        let store = test_store().await;
        let payload = serde_json::json!({});

        let a = store.seen_or_mark(Uuid::new_v4(), "PaymentCompleted", &payload).await.unwrap();
        let b = store.seen_or_mark(Uuid::new_v4(), "PaymentCompleted", &payload).await.unwrap();
        assert_eq!(a, SeenStatus::First);
        assert_eq!(b, SeenStatus::First);
    }
}
