//! Postgres-backed outbox store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{ColumnDef, Iden, Index, PostgresQueryBuilder, Table};
use sqlx::{PgPool, Row};
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

pub struct PostgresOutbox {
    pool: PgPool,
    table_name: String,
}

impl PostgresOutbox {
    pub fn new(pool: PgPool, table_name: impl Into<String>) -> Self {
        Self {
            pool,
            table_name: table_name.into(),
        }
    }

    pub async fn insert_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        row: NewOutboxRow,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(&format!(
            "INSERT INTO {} (id, kind, payload, topic, processed, created_at, processed_at) \
             VALUES ($1, $2, $3, $4, false, now(), NULL)",
            self.table_name
        ))
        .bind(id)
        .bind(&row.kind)
        .bind(&row.payload)
        .bind(&row.topic)
        .execute(&mut **tx)
        .await
        .map_err(|e| OutboxError::Database(e.to_string()))?;

        Ok(id)
    }
}

#[async_trait]
impl OutboxStore for PostgresOutbox {
    async fn init(&self) -> Result<()> {
        let create = Table::create()
            .table(Outbox::Table)
            .if_not_exists()
            .col(ColumnDef::new(Outbox::Id).uuid().primary_key())
            .col(ColumnDef::new(Outbox::Kind).text().not_null())
            .col(ColumnDef::new(Outbox::Payload).json_binary().not_null())
            .col(ColumnDef::new(Outbox::Topic).text().not_null())
            .col(ColumnDef::new(Outbox::Processed).boolean().not_null())
            .col(ColumnDef::new(Outbox::CreatedAt).timestamp_with_time_zone().not_null())
            .col(ColumnDef::new(Outbox::ProcessedAt).timestamp_with_time_zone())
            .to_string(PostgresQueryBuilder)
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
            .to_string(PostgresQueryBuilder)
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
             FROM {} WHERE processed = false ORDER BY created_at ASC LIMIT $1 \
             FOR UPDATE SKIP LOCKED",
            self.table_name
        ))
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| OutboxError::Database(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                Ok(OutboxRow {
                    id: row.try_get("id").map_err(|e| OutboxError::Database(e.to_string()))?,
                    kind: row.try_get("kind").map_err(|e| OutboxError::Database(e.to_string()))?,
                    payload: row
                        .try_get("payload")
                        .map_err(|e| OutboxError::Database(e.to_string()))?,
                    topic: row.try_get("topic").map_err(|e| OutboxError::Database(e.to_string()))?,
                    processed: row
                        .try_get("processed")
                        .map_err(|e| OutboxError::Database(e.to_string()))?,
                    created_at: row
                        .try_get("created_at")
                        .map_err(|e| OutboxError::Database(e.to_string()))?,
                    processed_at: row
                        .try_get("processed_at")
                        .map_err(|e| OutboxError::Database(e.to_string()))?,
                })
            })
            .collect()
    }

    async fn mark_processed(&self, id: Uuid, processed_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET processed = true, processed_at = $1 WHERE id = $2",
            self.table_name
        ))
        .bind(processed_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxError::Database(e.to_string()))?;

        Ok(())
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let totals = sqlx::query(&format!(
            "SELECT COUNT(*) as total, COUNT(*) FILTER (WHERE processed) as processed FROM {}",
            self.table_name
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| OutboxError::Database(e.to_string()))?;

        let total: i64 = totals.try_get("total").unwrap_or(0);
        let processed: i64 = totals.try_get("processed").unwrap_or(0);

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
