//! SQLite-backed saga log store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{ColumnDef, Iden, SqliteQueryBuilder, Table};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::model::{Compensation, CompensationKind, Saga, SagaState, Step, StepKind};
use super::store::{Result, SagaError, SagaListFilter, SagaLogStore};

#[derive(Iden)]
enum SagaLog {
    Table,
    Id,
    Type,
    State,
    InitialPayload,
    StartedAt,
    EndedAt,
    ErrorMessage,
    TimeoutMinutes,
    Version,
}

#[derive(Iden)]
enum SagaSteps {
    Table,
    Id,
    SagaId,
    Kind,
    Input,
    Result,
    Success,
    Error,
    ExecutedAt,
}

#[derive(Iden)]
enum SagaCompensations {
    Table,
    Id,
    SagaId,
    StepId,
    Kind,
    Input,
    Result,
    Success,
    Error,
    ExecutedAt,
}

pub struct SqliteSagaStore {
    pool: SqlitePool,
}

impl SqliteSagaStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_steps(&self, saga_id: Uuid) -> Result<Vec<Step>> {
        let rows = sqlx::query(
            "SELECT id, kind, input, result, success, error, executed_at \
             FROM saga_steps WHERE saga_id = ? ORDER BY rowid ASC",
        )
        .bind(saga_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SagaError::Database(e.to_string()))?;

        rows.into_iter().map(row_to_step).collect()
    }

    async fn load_compensations(&self, saga_id: Uuid) -> Result<Vec<Compensation>> {
        let rows = sqlx::query(
            "SELECT id, step_id, kind, input, result, success, error, executed_at \
             FROM saga_compensations WHERE saga_id = ? ORDER BY rowid ASC",
        )
        .bind(saga_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SagaError::Database(e.to_string()))?;

        rows.into_iter().map(row_to_compensation).collect()
    }

    async fn load_full(&self, header: Saga) -> Result<Saga> {
        let mut saga = header;
        saga.steps = self.load_steps(saga.id).await?;
        saga.compensations = self.load_compensations(saga.id).await?;
        Ok(saga)
    }

    async fn write_children(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        saga: &Saga,
    ) -> Result<()> {
        sqlx::query("DELETE FROM saga_steps WHERE saga_id = ?")
            .bind(saga.id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;
        sqlx::query("DELETE FROM saga_compensations WHERE saga_id = ?")
            .bind(saga.id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;

        for step in &saga.steps {
            sqlx::query(
                "INSERT INTO saga_steps (id, saga_id, kind, input, result, success, error, executed_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(step.id.to_string())
            .bind(saga.id.to_string())
            .bind(step.kind.as_str())
            .bind(step.input.to_string())
            .bind(step.result.as_ref().map(|v| v.to_string()))
            .bind(step.success)
            .bind(&step.error)
            .bind(step.executed_at.map(|t| t.to_rfc3339()))
            .execute(&mut **tx)
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;
        }

        for comp in &saga.compensations {
            sqlx::query(
                "INSERT INTO saga_compensations (id, saga_id, step_id, kind, input, result, success, error, executed_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(comp.id.to_string())
            .bind(saga.id.to_string())
            .bind(comp.step_id.to_string())
            .bind(comp.kind.as_str())
            .bind(comp.input.to_string())
            .bind(comp.result.as_ref().map(|v| v.to_string()))
            .bind(comp.success)
            .bind(&comp.error)
            .bind(comp.executed_at.map(|t| t.to_rfc3339()))
            .execute(&mut **tx)
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;
        }

        Ok(())
    }
}

#[async_trait]
impl SagaLogStore for SqliteSagaStore {
    async fn init(&self) -> Result<()> {
        for stmt in [
            Table::create()
                .table(SagaLog::Table)
                .if_not_exists()
                .col(ColumnDef::new(SagaLog::Id).text().primary_key())
                .col(ColumnDef::new(SagaLog::Type).text().not_null())
                .col(ColumnDef::new(SagaLog::State).text().not_null())
                .col(ColumnDef::new(SagaLog::InitialPayload).text().not_null())
                .col(ColumnDef::new(SagaLog::StartedAt).text().not_null())
                .col(ColumnDef::new(SagaLog::EndedAt).text())
                .col(ColumnDef::new(SagaLog::ErrorMessage).text())
                .col(ColumnDef::new(SagaLog::TimeoutMinutes).big_integer().not_null())
                .col(ColumnDef::new(SagaLog::Version).big_integer().not_null())
                .to_string(SqliteQueryBuilder),
            Table::create()
                .table(SagaSteps::Table)
                .if_not_exists()
                .col(ColumnDef::new(SagaSteps::Id).text().primary_key())
                .col(ColumnDef::new(SagaSteps::SagaId).text().not_null())
                .col(ColumnDef::new(SagaSteps::Kind).text().not_null())
                .col(ColumnDef::new(SagaSteps::Input).text().not_null())
                .col(ColumnDef::new(SagaSteps::Result).text())
                .col(ColumnDef::new(SagaSteps::Success).boolean().not_null())
                .col(ColumnDef::new(SagaSteps::Error).text())
                .col(ColumnDef::new(SagaSteps::ExecutedAt).text())
                .to_string(SqliteQueryBuilder),
            Table::create()
                .table(SagaCompensations::Table)
                .if_not_exists()
                .col(ColumnDef::new(SagaCompensations::Id).text().primary_key())
                .col(ColumnDef::new(SagaCompensations::SagaId).text().not_null())
                .col(ColumnDef::new(SagaCompensations::StepId).text().not_null())
                .col(ColumnDef::new(SagaCompensations::Kind).text().not_null())
                .col(ColumnDef::new(SagaCompensations::Input).text().not_null())
                .col(ColumnDef::new(SagaCompensations::Result).text())
                .col(ColumnDef::new(SagaCompensations::Success).boolean().not_null())
                .col(ColumnDef::new(SagaCompensations::Error).text())
                .col(ColumnDef::new(SagaCompensations::ExecutedAt).text())
                .to_string(SqliteQueryBuilder),
        ] {
            sqlx::query(&stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| SagaError::Database(e.to_string()))?;
        }

        for index in [
            "CREATE INDEX IF NOT EXISTS ix_saga_log_state ON saga_log (state)",
            "CREATE INDEX IF NOT EXISTS ix_saga_log_type ON saga_log (type)",
            "CREATE INDEX IF NOT EXISTS ix_saga_log_started_at ON saga_log (started_at)",
            "CREATE INDEX IF NOT EXISTS ix_saga_steps_saga_id ON saga_steps (saga_id)",
            "CREATE INDEX IF NOT EXISTS ix_saga_compensations_saga_id ON saga_compensations (saga_id)",
        ] {
            sqlx::query(index)
                .execute(&self.pool)
                .await
                .map_err(|e| SagaError::Database(e.to_string()))?;
        }

        Ok(())
    }

    async fn create(&self, saga: &Saga) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;

        sqlx::query(
            "INSERT INTO saga_log (id, type, state, initial_payload, started_at, ended_at, error_message, timeout_minutes, version) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(saga.id.to_string())
        .bind(&saga.saga_type)
        .bind(saga.state.as_string())
        .bind(saga.initial_payload.to_string())
        .bind(saga.started_at.to_rfc3339())
        .bind(saga.ended_at.map(|t| t.to_rfc3339()))
        .bind(&saga.error_message)
        .bind(saga.timeout_minutes)
        .bind(saga.version)
        .execute(&mut *tx)
        .await
        .map_err(|e| SagaError::Database(e.to_string()))?;

        self.write_children(&mut tx, saga).await?;

        tx.commit().await.map_err(|e| SagaError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Saga> {
        let row = sqlx::query(
            "SELECT id, type, state, initial_payload, started_at, ended_at, error_message, timeout_minutes, version \
             FROM saga_log WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SagaError::Database(e.to_string()))?
        .ok_or(SagaError::NotFound(id))?;

        let header = row_to_saga_header(row)?;
        self.load_full(header).await
    }

    async fn update(&self, saga: &Saga, expected_version: i64) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;

        let new_version = expected_version + 1;
        let result = sqlx::query(
            "UPDATE saga_log SET state = ?, ended_at = ?, error_message = ?, version = ? \
             WHERE id = ? AND version = ?",
        )
        .bind(saga.state.as_string())
        .bind(saga.ended_at.map(|t| t.to_rfc3339()))
        .bind(&saga.error_message)
        .bind(new_version)
        .bind(saga.id.to_string())
        .bind(expected_version)
        .execute(&mut *tx)
        .await
        .map_err(|e| SagaError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            let actual: i64 = sqlx::query("SELECT version FROM saga_log WHERE id = ?")
                .bind(saga.id.to_string())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| SagaError::Database(e.to_string()))?
                .try_get("version")
                .unwrap_or(-1);
            return Err(SagaError::VersionConflict {
                id: saga.id,
                expected: expected_version,
                actual,
            });
        }

        self.write_children(&mut tx, saga).await?;

        tx.commit().await.map_err(|e| SagaError::Database(e.to_string()))?;
        Ok(())
    }

    async fn list_by_state(&self, state: SagaState) -> Result<Vec<Saga>> {
        self.list(&SagaListFilter {
            state: Some(state),
            saga_type: None,
            page: 0,
            limit: u32::MAX,
        })
        .await
    }

    async fn list_by_type(&self, saga_type: &str) -> Result<Vec<Saga>> {
        self.list(&SagaListFilter {
            state: None,
            saga_type: Some(saga_type.to_string()),
            page: 0,
            limit: u32::MAX,
        })
        .await
    }

    async fn list_pending(&self) -> Result<Vec<Saga>> {
        let rows = sqlx::query(
            "SELECT id, type, state, initial_payload, started_at, ended_at, error_message, timeout_minutes, version \
             FROM saga_log WHERE state NOT IN ('COMPLETED', 'FAILED', 'COMPENSATED', 'TIMED_OUT')",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SagaError::Database(e.to_string()))?;

        let mut sagas = Vec::with_capacity(rows.len());
        for row in rows {
            sagas.push(self.load_full(row_to_saga_header(row)?).await?);
        }
        Ok(sagas)
    }

    async fn list(&self, filter: &SagaListFilter) -> Result<Vec<Saga>> {
        let limit = if filter.limit == 0 { 50 } else { filter.limit.min(1000) };
        let offset = filter.page.saturating_mul(limit);

        let mut query = String::from(
            "SELECT id, type, state, initial_payload, started_at, ended_at, error_message, timeout_minutes, version \
             FROM saga_log WHERE 1 = 1",
        );
        if filter.state.is_some() {
            query.push_str(" AND state = ?");
        }
        if filter.saga_type.is_some() {
            query.push_str(" AND type = ?");
        }
        query.push_str(" ORDER BY started_at DESC LIMIT ? OFFSET ?");

        let mut q = sqlx::query(&query);
        if let Some(state) = &filter.state {
            q = q.bind(state.as_string());
        }
        if let Some(saga_type) = &filter.saga_type {
            q = q.bind(saga_type.clone());
        }
        q = q.bind(limit).bind(offset);

        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;

        let mut sagas = Vec::with_capacity(rows.len());
        for row in rows {
            sagas.push(self.load_full(row_to_saga_header(row)?).await?);
        }
        Ok(sagas)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;

        sqlx::query("DELETE FROM saga_compensations WHERE saga_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;
        sqlx::query("DELETE FROM saga_steps WHERE saga_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;
        sqlx::query("DELETE FROM saga_log WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| SagaError::Database(e.to_string()))?;
        Ok(())
    }
}

fn row_to_saga_header(row: sqlx::sqlite::SqliteRow) -> Result<Saga> {
    let id: String = row.try_get("id").map_err(|e| SagaError::Database(e.to_string()))?;
    let state: String = row.try_get("state").map_err(|e| SagaError::Database(e.to_string()))?;
    let initial_payload: String = row
        .try_get("initial_payload")
        .map_err(|e| SagaError::Database(e.to_string()))?;
    let started_at: String = row
        .try_get("started_at")
        .map_err(|e| SagaError::Database(e.to_string()))?;
    let ended_at: Option<String> = row
        .try_get("ended_at")
        .map_err(|e| SagaError::Database(e.to_string()))?;

    Ok(Saga {
        id: Uuid::parse_str(&id).map_err(|e| SagaError::Database(e.to_string()))?,
        saga_type: row.try_get("type").map_err(|e| SagaError::Database(e.to_string()))?,
        state: SagaState::parse(&state).map_err(SagaError::Database)?,
        initial_payload: serde_json::from_str(&initial_payload)
            .map_err(|e| SagaError::Database(e.to_string()))?,
        started_at: parse_dt(&started_at)?,
        ended_at: ended_at.map(|s| parse_dt(&s)).transpose()?,
        error_message: row
            .try_get("error_message")
            .map_err(|e| SagaError::Database(e.to_string()))?,
        timeout_minutes: row
            .try_get("timeout_minutes")
            .map_err(|e| SagaError::Database(e.to_string()))?,
        version: row.try_get("version").map_err(|e| SagaError::Database(e.to_string()))?,
        steps: vec![],
        compensations: vec![],
    })
}

fn row_to_step(row: sqlx::sqlite::SqliteRow) -> Result<Step> {
    let id: String = row.try_get("id").map_err(|e| SagaError::Database(e.to_string()))?;
    let kind: String = row.try_get("kind").map_err(|e| SagaError::Database(e.to_string()))?;
    let input: String = row.try_get("input").map_err(|e| SagaError::Database(e.to_string()))?;
    let result: Option<String> = row.try_get("result").map_err(|e| SagaError::Database(e.to_string()))?;
    let executed_at: Option<String> = row
        .try_get("executed_at")
        .map_err(|e| SagaError::Database(e.to_string()))?;

    Ok(Step {
        id: Uuid::parse_str(&id).map_err(|e| SagaError::Database(e.to_string()))?,
        kind: kind.parse::<StepKind>().map_err(SagaError::Database)?,
        input: serde_json::from_str(&input).map_err(|e| SagaError::Database(e.to_string()))?,
        result: result
            .map(|s| serde_json::from_str(&s).map_err(|e| SagaError::Database(e.to_string())))
            .transpose()?,
        success: row.try_get("success").map_err(|e| SagaError::Database(e.to_string()))?,
        error: row.try_get("error").map_err(|e| SagaError::Database(e.to_string()))?,
        executed_at: executed_at.map(|s| parse_dt(&s)).transpose()?,
    })
}

fn row_to_compensation(row: sqlx::sqlite::SqliteRow) -> Result<Compensation> {
    let id: String = row.try_get("id").map_err(|e| SagaError::Database(e.to_string()))?;
    let step_id: String = row.try_get("step_id").map_err(|e| SagaError::Database(e.to_string()))?;
    let kind: String = row.try_get("kind").map_err(|e| SagaError::Database(e.to_string()))?;
    let input: String = row.try_get("input").map_err(|e| SagaError::Database(e.to_string()))?;
    let result: Option<String> = row.try_get("result").map_err(|e| SagaError::Database(e.to_string()))?;
    let executed_at: Option<String> = row
        .try_get("executed_at")
        .map_err(|e| SagaError::Database(e.to_string()))?;

    Ok(Compensation {
        id: Uuid::parse_str(&id).map_err(|e| SagaError::Database(e.to_string()))?,
        step_id: Uuid::parse_str(&step_id).map_err(|e| SagaError::Database(e.to_string()))?,
        kind: kind.parse::<CompensationKind>().map_err(SagaError::Database)?,
        input: serde_json::from_str(&input).map_err(|e| SagaError::Database(e.to_string()))?,
        result: result
            .map(|s| serde_json::from_str(&s).map_err(|e| SagaError::Database(e.to_string())))
            .transpose()?,
        success: row.try_get("success").map_err(|e| SagaError::Database(e.to_string()))?,
        error: row.try_get("error").map_err(|e| SagaError::Database(e.to_string()))?,
        executed_at: executed_at.map(|s| parse_dt(&s)).transpose()?,
    })
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SagaError::Database(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::model::SagaTopology;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> SqliteSagaStore {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let store = SqliteSagaStore::new(pool);
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn create_then_get_round_trips_steps() {
        let store = test_store().await;
        let saga = SagaTopology::new_saga(
            serde_json::json!({"nombre": "Promo"}),
            serde_json::json!({"monto": 1000}),
            serde_json::json!({}),
            30,
        );
        store.create(&saga).await.unwrap();

        let loaded = store.get(saga.id).await.unwrap();
        assert_eq!(loaded.steps.len(), 3);
        assert_eq!(loaded.state.as_string(), "STARTED");
    }

    #[tokio::test]
    async fn update_with_stale_version_conflicts() {
        let store = test_store().await;
        let mut saga = SagaTopology::new_saga(
            serde_json::json!({}),
            serde_json::json!({}),
            serde_json::json!({}),
            30,
        );
        store.create(&saga).await.unwrap();

        saga.steps[0].mark_success(serde_json::json!({}));
        saga.advance_after_step_success();
        store.update(&saga, 0).await.unwrap();

        // Retrying with the same stale expected_version must conflict.
        let err = store.update(&saga, 0).await.unwrap_err();
        assert!(matches!(err, SagaError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn list_pending_excludes_terminal_states() {
        let store = test_store().await;
        let saga = SagaTopology::new_saga(
            serde_json::json!({}),
            serde_json::json!({}),
            serde_json::json!({}),
            30,
        );
        store.create(&saga).await.unwrap();

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);

        let mut saga = store.get(saga.id).await.unwrap();
        saga.fail_without_compensation("boom");
        store.update(&saga, 0).await.unwrap();

        let pending = store.list_pending().await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_saga_and_children() {
        let store = test_store().await;
        let saga = SagaTopology::new_saga(
            serde_json::json!({}),
            serde_json::json!({}),
            serde_json::json!({}),
            30,
        );
        store.create(&saga).await.unwrap();
        store.delete(saga.id).await.unwrap();

        let err = store.get(saga.id).await.unwrap_err();
        assert!(matches!(err, SagaError::NotFound(_)));
    }
}
