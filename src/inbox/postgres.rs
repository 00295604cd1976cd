//! Postgres-backed inbox store.

use async_trait::async_trait;
use chrono::Utc;
use sea_query::{ColumnDef, Iden, PostgresQueryBuilder, Table};
use sqlx::PgPool;
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

pub struct PostgresInbox {
    pool: PgPool,
    table_name: String,
}

impl PostgresInbox {
    pub fn new(pool: PgPool, table_name: impl Into<String>) -> Self {
        Self {
            pool,
            table_name: table_name.into(),
        }
    }
}

#[async_trait]
impl InboxStore for PostgresInbox {
    async fn init(&self) -> Result<()> {
        let create = Table::create()
            .table(Inbox::Table)
            .if_not_exists()
            .col(ColumnDef::new(Inbox::EventId).uuid().primary_key())
            .col(ColumnDef::new(Inbox::Kind).text().not_null())
            .col(ColumnDef::new(Inbox::Payload).json_binary().not_null())
            .col(ColumnDef::new(Inbox::ProcessedAt).timestamp_with_time_zone().not_null())
            .to_string(PostgresQueryBuilder)
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
            "INSERT INTO {} (event_id, kind, payload, processed_at) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (event_id) DO NOTHING",
            self.table_name
        ))
        .bind(event_id)
        .bind(kind)
        .bind(payload)
        .bind(Utc::now())
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
