//! SQLite-backed data-service configuration store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{ColumnDef, Iden, Index, SqliteQueryBuilder, Table};
use sqlx::{Row, SqlitePool};

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

pub struct SqliteDataServiceConfigStore {
    pool: SqlitePool,
}

impl SqliteDataServiceConfigStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DataServiceConfigStore for SqliteDataServiceConfigStore {
    async fn init(&self) -> Result<()> {
        let create = Table::create()
            .table(DataServiceConfigTable::Table)
            .if_not_exists()
            .col(
                ColumnDef::new(DataServiceConfigTable::Id)
                    .integer()
                    .primary_key()
                    .auto_increment(),
            )
            .col(ColumnDef::new(DataServiceConfigTable::Url).text().not_null())
            .col(ColumnDef::new(DataServiceConfigTable::Version).text().not_null())
            .col(ColumnDef::new(DataServiceConfigTable::Active).boolean().not_null())
            .col(ColumnDef::new(DataServiceConfigTable::UpdatedAt).text().not_null())
            .to_string(SqliteQueryBuilder);

        sqlx::query(&create)
            .execute(&self.pool)
            .await
            .map_err(|e| DataServiceConfigError::Database(e.to_string()))?;

        let index = Index::create()
            .if_not_exists()
            .name("ix_data_service_config_active")
            .table(DataServiceConfigTable::Table)
            .col(DataServiceConfigTable::Active)
            .to_string(SqliteQueryBuilder);

        sqlx::query(&index)
            .execute(&self.pool)
            .await
            .map_err(|e| DataServiceConfigError::Database(e.to_string()))?;

        Ok(())
    }

    async fn get_active(&self) -> Result<Option<DataServiceConfig>> {
        let row = sqlx::query(
            "SELECT id, url, version, active, updated_at FROM data_service_config \
             WHERE active = 1 LIMIT 1",
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

        sqlx::query("UPDATE data_service_config SET active = 0 WHERE active = 1")
            .execute(&mut *tx)
            .await
            .map_err(|e| DataServiceConfigError::Database(e.to_string()))?;

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO data_service_config (url, version, active, updated_at) \
             VALUES (?, ?, 1, ?)",
        )
        .bind(&url)
        .bind(&version)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| DataServiceConfigError::Database(e.to_string()))?;

        let id = result.last_insert_rowid();

        tx.commit().await.map_err(|e| DataServiceConfigError::Database(e.to_string()))?;

        Ok(DataServiceConfig {
            id,
            url,
            version,
            active: true,
            updated_at: now,
        })
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

fn row_to_config(row: sqlx::sqlite::SqliteRow) -> Result<DataServiceConfig> {
    let updated_at: String = row
        .try_get("updated_at")
        .map_err(|e| DataServiceConfigError::Database(e.to_string()))?;

    Ok(DataServiceConfig {
        id: row.try_get("id").map_err(|e| DataServiceConfigError::Database(e.to_string()))?,
        url: row.try_get("url").map_err(|e| DataServiceConfigError::Database(e.to_string()))?,
        version: row
            .try_get("version")
            .map_err(|e| DataServiceConfigError::Database(e.to_string()))?,
        active: row
            .try_get::<bool, _>("active")
            .map_err(|e| DataServiceConfigError::Database(e.to_string()))?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| DataServiceConfigError::Database(e.to_string()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> SqliteDataServiceConfigStore {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let store = SqliteDataServiceConfigStore::new(pool);
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn activate_deactivates_previous_and_becomes_active() {
        let store = test_store().await;
        store.activate("http://v1".to_string(), "1".to_string()).await.unwrap();
        store.activate("http://v2".to_string(), "2".to_string()).await.unwrap();

        let active = store.get_active().await.unwrap().unwrap();
        assert_eq!(active.url, "http://v2");
        assert_eq!(active.version, "2");

        let history = store.history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history.iter().find(|c| c.url == "http://v1").unwrap().active);
    }

    #[tokio::test]
    async fn no_active_row_before_any_activation() {
        let store = test_store().await;
        assert!(store.get_active().await.unwrap().is_none());
    }
}
