//! Data-service configuration: the currently-active URL/version of the
//! downstream data service that
//! [`crate::participants::GenerateReportAdapter`] calls, switchable at
//! runtime through the reporting admin endpoints without a restart.
//!
//! Exactly one row is ever active — switching configuration atomically
//! deactivates the current row and inserts the new one, the same
//! single-active-row pattern the reporting module's configuration table
//! uses upstream.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub use postgres::PostgresDataServiceConfigStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDataServiceConfigStore;

pub type Result<T> = std::result::Result<T, DataServiceConfigError>;

#[derive(Debug, thiserror::Error)]
pub enum DataServiceConfigError {
    #[error("database error: {0}")]
    Database(String),
}

/// A single point-in-time configuration of the data service.
#[derive(Debug, Clone, Serialize)]
pub struct DataServiceConfig {
    pub id: i64,
    pub url: String,
    pub version: String,
    pub active: bool,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait DataServiceConfigStore: Send + Sync {
    async fn init(&self) -> Result<()>;

    /// The currently active configuration, if any was ever activated.
    async fn get_active(&self) -> Result<Option<DataServiceConfig>>;

    /// Atomically deactivate whatever is currently active and activate a
    /// new configuration. Switching never leaves two rows active at once.
    async fn activate(&self, url: String, version: String) -> Result<DataServiceConfig>;

    /// Every configuration ever activated, most recent first.
    async fn history(&self) -> Result<Vec<DataServiceConfig>>;
}

/// In-memory store — used by tests and by deployments that don't need the
/// configuration to survive a restart.
#[derive(Default)]
pub struct InMemoryDataServiceConfigStore {
    rows: Mutex<Vec<DataServiceConfig>>,
}

impl InMemoryDataServiceConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataServiceConfigStore for InMemoryDataServiceConfigStore {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn get_active(&self) -> Result<Option<DataServiceConfig>> {
        Ok(self.rows.lock().unwrap().iter().find(|c| c.active).cloned())
    }

    async fn activate(&self, url: String, version: String) -> Result<DataServiceConfig> {
        let mut rows = self.rows.lock().unwrap();
        for row in rows.iter_mut() {
            row.active = false;
        }
        let id = rows.len() as i64 + 1;
        let config = DataServiceConfig {
            id,
            url,
            version,
            active: true,
            updated_at: Utc::now(),
        };
        rows.push(config.clone());
        Ok(config)
    }

    async fn history(&self) -> Result<Vec<DataServiceConfig>> {
        let mut rows = self.rows.lock().unwrap().clone();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn activating_deactivates_the_previous_row() {
        let store = InMemoryDataServiceConfigStore::new();
        store.init().await.unwrap();

        let first = store.activate("http://v1".to_string(), "1".to_string()).await.unwrap();
        assert!(first.active);

        let second = store.activate("http://v2".to_string(), "2".to_string()).await.unwrap();
        assert!(second.active);

        let active = store.get_active().await.unwrap().unwrap();
        assert_eq!(active.url, "http://v2");

        let history = store.history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(!history.iter().find(|c| c.id == first.id).unwrap().active);
    }

    #[tokio::test]
    async fn no_active_configuration_before_any_activation() {
        let store = InMemoryDataServiceConfigStore::new();
        store.init().await.unwrap();
        assert!(store.get_active().await.unwrap().is_none());
    }
}
