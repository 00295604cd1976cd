//! Postgres-backed data-service configuration store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{ColumnDef, Iden, Index, PostgresQueryBuilder, Table};
use sqlx::{PgPool, Row};

use super::{DataServiceConfig, DataServiceConfigError, DataServiceConfigStore, Result};

#[derive(Iden)]
enum DataServiceConfigTable {
    Table,
    Id,
    Url,
    Version,
    Active,
    UpdatedAt,
}

pub struct PostgresDataServiceConfigStore {
    pool: PgPool,
}

impl PostgresDataServiceConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DataServiceConfigStore for PostgresDataServiceConfigStore {
    async fn init(&self) -> Result<()> {
        let create = Table::create()
            .table(DataServiceConfigTable::Table)
            .if_not_exists()
            .col(
                ColumnDef::new(DataServiceConfigTable::Id)
                    .big_integer()
                    .primary_key()
                    .auto_increment(),
            )
            .col(ColumnDef::new(DataServiceConfigTable::Url).text().not_null())
            .col(ColumnDef::new(DataServiceConfigTable::Version).text().not_null())
            .col(ColumnDef::new(DataServiceConfigTable::Active).boolean().not_null())
            .col(
                ColumnDef::new(DataServiceConfigTable::UpdatedAt)
                    .timestamp_with_time_zone()
                    .not_null(),
            )
            .to_string(PostgresQueryBuilder);

        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .map_err(|e| DataServiceConfigError::Database(e.to_string()))?;

        let index = Index::create()
            .if_not_exists()
            .name("ix_data_service_config_active")
            .table(DataServiceConfigTable::Table)
            .col(DataServiceConfigTable::Active)
            .to_string(PostgresQueryBuilder);

        sqlx::query(&index)
            .execute(&self.pool)
            .await
            .map_err(|e| DataServiceConfigError::Database(e.to_string()))?;

        Ok(())
    }

    async fn get_active(&self) -> Result<Option<DataServiceConfig>> {
        let row = sqlx::query(
            "SELECT id, url, version, active, updated_at FROM data_service_config \
             WHERE active = true LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DataServiceConfigError::Database(e.to_string()))?;

        row.map(row_to_config).transpose()
    }

    async fn activate(&self, url: String, version: String) -> Result<DataServiceConfig> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DataServiceConfigError::Database(e.to_string()))?;

        sqlx::query("UPDATE data_service_config SET active = false WHERE active = true")
            .execute(&mut *tx)
            .await
            .map_err(|e| DataServiceConfigError::Database(e.to_string()))?;

        let row = sqlx::query(
            "INSERT INTO data_service_config (url, version, active, updated_at) \
             VALUES ($1, $2, true, now()) RETURNING id, url, version, active, updated_at",
        )
        .bind(&url)
        .bind(&version)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| DataServiceConfigError::Database(e.to_string()))?;

        let config = row_to_config(row)?;

        tx.commit().await.map_err(|e| DataServiceConfigError::Database(e.to_string()))?;

        Ok(config)
    }

    async fn history(&self) -> Result<Vec<DataServiceConfig>> {
        let rows = sqlx::query(
            "SELECT id, url, version, active, updated_at FROM data_service_config \
             ORDER BY id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DataServiceConfigError::Database(e.to_string()))?;

        rows.into_iter().map(row_to_config).collect()
    }
}

fn row_to_config(row: sqlx::postgres::PgRow) -> Result<DataServiceConfig> {
    Ok(DataServiceConfig {
        id: row.try_get("id").map_err(|e| DataServiceConfigError::Database(e.to_string()))?,
        url: row.try_get("url").map_err(|e| DataServiceConfigError::Database(e.to_string()))?,
        version: row
            .try_get("version")
            .map_err(|e| DataServiceConfigError::Database(e.to_string()))?,
        active: row
            .try_get("active")
            .map_err(|e| DataServiceConfigError::Database(e.to_string()))?,
        updated_at: row
            .try_get::<DateTime<Utc>, _>("updated_at")
            .map_err(|e| DataServiceConfigError::Database(e.to_string()))?,
    })
}
