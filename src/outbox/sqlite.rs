//! SQLite-backed outbox store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{ColumnDef, Iden, Index, SqliteQueryBuilder, Table};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{NewOutboxRow, OutboxError, OutboxRow, OutboxStats, OutboxStore, Result};

#[derive(Iden)]
enum Outbox {
    Table,
    Id,
    Kind,
    Payload,
    Topic,
    Processed,
    CreatedAt,
    ProcessedAt,
}

/// Outbox table scoped to a single service's own SQLite database.
pub struct SqliteOutbox {
    pool: SqlitePool,
    table_name: String,
}

impl SqliteOutbox {
    pub fn new(pool: SqlitePool, table_name: impl Into<String>) -> Self {
        Self {
            pool,
            table_name: table_name.into(),
        }
    }

    /// Insert a new row as part of the caller's own business transaction —
    /// this is the "atomic with the state change" half of the outbox
    /// contract; the caller commits the transaction.
    pub async fn insert_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        row: NewOutboxRow,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(&format!(
            "INSERT INTO {} (id, kind, payload, topic, processed, created_at, processed_at) \
             VALUES (?, ?, ?, ?, 0, ?, NULL)",
            self.table_name
        ))
        .bind(id.to_string())
        .bind(&row.kind)
        .bind(row.payload.to_string())
        .bind(&row.topic)
        .bind(now.to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(|e| OutboxError::Database(e.to_string()))?;

        Ok(id)
    }
}

#[async_trait]
impl OutboxStore for SqliteOutbox {
    async fn init(&self) -> Result<()> {
        let create = Table::create()
            .table(Outbox::Table)
            .if_not_exists()
            .col(ColumnDef::new(Outbox::Id).text().primary_key())
            .col(ColumnDef::new(Outbox::Kind).text().not_null())
            .col(ColumnDef::new(Outbox::Payload).text().not_null())
            .col(ColumnDef::new(Outbox::Topic).text().not_null())
            .col(ColumnDef::new(Outbox::Processed).boolean().not_null())
            .col(ColumnDef::new(Outbox::CreatedAt).text().not_null())
            .col(ColumnDef::new(Outbox::ProcessedAt).text())
            .to_string(SqliteQueryBuilder)
            .replace("\"outbox\"", &self.table_name);

        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))?;

        let index = Index::create()
            .if_not_exists()
            .name(&format!("ix_{}_pending", self.table_name))
            .table(Outbox::Table)
            .col(Outbox::Processed)
            .col(Outbox::CreatedAt)
            .to_string(SqliteQueryBuilder)
            .replace("\"outbox\"", &self.table_name);

        sqlx::query(&index)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::Database(e.to_string()))?;

        Ok(())
    }

    async fn select_pending(&self, batch_size: u32) -> Result<Vec<OutboxRow>> {
        let rows = sqlx::query(&format!(
            "SELECT id, kind, payload, topic, processed, created_at, processed_at \
             FROM {} WHERE processed = 0 ORDER BY created_at ASC LIMIT ?",
            self.table_name
        ))
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OutboxError::Database(e.to_string()))?;

        rows.into_iter().map(row_to_outbox).collect()
    }

    async fn mark_processed(&self, id: Uuid, processed_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET processed = 1, processed_at = ? WHERE id = ?",
            self.table_name
        ))
        .bind(processed_at.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxError::Database(e.to_string()))?;

        Ok(())
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let totals = sqlx::query(&format!(
            "SELECT COUNT(*) as total, \
                    SUM(CASE WHEN processed = 1 THEN 1 ELSE 0 END) as processed \
             FROM {}",
            self.table_name
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| OutboxError::Database(e.to_string()))?;

        let total: i64 = totals.try_get("total").unwrap_or(0);
        let processed: i64 = totals.try_get::<Option<i64>, _>("processed").ok().flatten().unwrap_or(0);

        let by_kind_rows = sqlx::query(&format!(
            "SELECT kind, COUNT(*) as count FROM {} GROUP BY kind",
            self.table_name
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OutboxError::Database(e.to_string()))?;

        let mut by_kind = std::collections::HashMap::new();
        for row in by_kind_rows {
            let kind: String = row.try_get("kind").unwrap_or_default();
            let count: i64 = row.try_get("count").unwrap_or(0);
            by_kind.insert(kind, count);
        }

        Ok(OutboxStats {
            total,
            processed,
            pending: total - processed,
            by_kind,
        })
    }

    async fn insert_standalone(&self, row: NewOutboxRow) -> Result<Uuid> {
        let mut tx = self.pool.begin().await.map_err(|e| OutboxError::Database(e.to_string()))?;
        let id = self.insert_in_tx(&mut tx, row).await?;
        tx.commit().await.map_err(|e| OutboxError::Database(e.to_string()))?;
        Ok(id)
    }
}

fn row_to_outbox(row: sqlx::sqlite::SqliteRow) -> Result<OutboxRow> {
    let id: String = row.try_get("id").map_err(|e| OutboxError::Database(e.to_string()))?;
    let payload: String = row
        .try_get("payload")
        .map_err(|e| OutboxError::Database(e.to_string()))?;
    let created_at: String = row
        .try_get("created_at")
        .map_err(|e| OutboxError::Database(e.to_string()))?;
    let processed_at: Option<String> = row
        .try_get("processed_at")
        .map_err(|e| OutboxError::Database(e.to_string()))?;

    Ok(OutboxRow {
        id: Uuid::parse_str(&id).map_err(|e| OutboxError::Serialization(e.to_string()))?,
        kind: row.try_get("kind").map_err(|e| OutboxError::Database(e.to_string()))?,
        payload: serde_json::from_str(&payload).map_err(|e| OutboxError::Serialization(e.to_string()))?,
        topic: row.try_get("topic").map_err(|e| OutboxError::Database(e.to_string()))?,
        processed: row
            .try_get::<bool, _>("processed")
            .map_err(|e| OutboxError::Database(e.to_string()))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| OutboxError::Serialization(e.to_string()))?,
        processed_at: processed_at
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| OutboxError::Serialization(e.to_string()))
            })
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> SqliteOutbox {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteOutbox::new(pool, "outbox".to_string());
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let store = test_store().await;
        store.init().await.unwrap();
    }

    #[tokio::test]
    async fn insert_then_select_pending_then_mark_processed() {
        let store = test_store().await;
        let mut tx = store.pool.begin().await.unwrap();
        let id = store
            .insert_in_tx(
                &mut tx,
                NewOutboxRow {
                    kind: "SagaStarted".to_string(),
                    payload: serde_json::json!({"aggregate_id": "saga-1"}),
                    topic: "saga-events".to_string(),
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let pending = store.select_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert!(!pending[0].processed);

        store.mark_processed(id, Utc::now()).await.unwrap();
        let pending = store.select_pending(10).await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn stats_reflect_processed_and_pending() {
        let store = test_store().await;
        let mut tx = store.pool.begin().await.unwrap();
        store
            .insert_in_tx(
                &mut tx,
                NewOutboxRow {
                    kind: "SagaStarted".to_string(),
                    payload: serde_json::json!({}),
                    topic: "saga-events".to_string(),
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.by_kind.get("SagaStarted"), Some(&1));
    }
}
