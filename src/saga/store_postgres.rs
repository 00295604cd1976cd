//! Postgres-backed saga log store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{ColumnDef, Iden, PostgresQueryBuilder, Table};
use serde_json::Value;
use sqlx::{PgPool, Row};
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

pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_steps(&self, saga_id: Uuid) -> Result<Vec<Step>> {
        let rows = sqlx::query(
            "SELECT id, kind, input, result, success, error, executed_at \
             FROM saga_steps WHERE saga_id = $1 ORDER BY ctid ASC",
        )
        .bind(saga_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SagaError::Database(e.to_string()))?;

        rows.into_iter().map(row_to_step).collect()
    }

    async fn load_compensations(&self, saga_id: Uuid) -> Result<Vec<Compensation>> {
        let rows = sqlx::query(
            "SELECT id, step_id, kind, input, result, success, error, executed_at \
             FROM saga_compensations WHERE saga_id = $1 ORDER BY ctid ASC",
        )
        .bind(saga_id)
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
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        saga: &Saga,
    ) -> Result<()> {
        sqlx::query("DELETE FROM saga_steps WHERE saga_id = $1")
            .bind(saga.id)
            .execute(&mut **tx)
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;
        sqlx::query("DELETE FROM saga_compensations WHERE saga_id = $1")
            .bind(saga.id)
            .execute(&mut **tx)
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;

        for step in &saga.steps {
            sqlx::query(
                "INSERT INTO saga_steps (id, saga_id, kind, input, result, success, error, executed_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(step.id)
            .bind(saga.id)
            .bind(step.kind.as_str())
            .bind(&step.input)
            .bind(&step.result)
            .bind(step.success)
            .bind(&step.error)
            .bind(step.executed_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;
        }

        for comp in &saga.compensations {
            sqlx::query(
                "INSERT INTO saga_compensations (id, saga_id, step_id, kind, input, result, success, error, executed_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(comp.id)
            .bind(saga.id)
            .bind(comp.step_id)
            .bind(comp.kind.as_str())
            .bind(&comp.input)
            .bind(&comp.result)
            .bind(comp.success)
            .bind(&comp.error)
            .bind(comp.executed_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;
        }

        Ok(())
    }
}

#[async_trait]
impl SagaLogStore for PostgresSagaStore {
    async fn init(&self) -> Result<()> {
        for stmt in [
            Table::create()
                .table(SagaLog::Table)
                .if_not_exists()
                .col(ColumnDef::new(SagaLog::Id).uuid().primary_key())
                .col(ColumnDef::new(SagaLog::Type).text().not_null())
                .col(ColumnDef::new(SagaLog::State).text().not_null())
                .col(ColumnDef::new(SagaLog::InitialPayload).json_binary().not_null())
                .col(ColumnDef::new(SagaLog::StartedAt).timestamp_with_time_zone().not_null())
                .col(ColumnDef::new(SagaLog::EndedAt).timestamp_with_time_zone())
                .col(ColumnDef::new(SagaLog::ErrorMessage).text())
                .col(ColumnDef::new(SagaLog::TimeoutMinutes).big_integer().not_null())
                .col(ColumnDef::new(SagaLog::Version).big_integer().not_null())
                .to_string(PostgresQueryBuilder),
            Table::create()
                .table(SagaSteps::Table)
                .if_not_exists()
                .col(ColumnDef::new(SagaSteps::Id).uuid().primary_key())
                .col(ColumnDef::new(SagaSteps::SagaId).uuid().not_null())
                .col(ColumnDef::new(SagaSteps::Kind).text().not_null())
                .col(ColumnDef::new(SagaSteps::Input).json_binary().not_null())
                .col(ColumnDef::new(SagaSteps::Result).json_binary())
                .col(ColumnDef::new(SagaSteps::Success).boolean().not_null())
                .col(ColumnDef::new(SagaSteps::Error).text())
                .col(ColumnDef::new(SagaSteps::ExecutedAt).timestamp_with_time_zone())
                .to_string(PostgresQueryBuilder),
            Table::create()
                .table(SagaCompensations::Table)
                .if_not_exists()
                .col(ColumnDef::new(SagaCompensations::Id).uuid().primary_key())
                .col(ColumnDef::new(SagaCompensations::SagaId).uuid().not_null())
                .col(ColumnDef::new(SagaCompensations::StepId).uuid().not_null())
                .col(ColumnDef::new(SagaCompensations::Kind).text().not_null())
                .col(ColumnDef::new(SagaCompensations::Input).json_binary().not_null())
                .col(ColumnDef::new(SagaCompensations::Result).json_binary())
                .col(ColumnDef::new(SagaCompensations::Success).boolean().not_null())
                .col(ColumnDef::new(SagaCompensations::Error).text())
                .col(ColumnDef::new(SagaCompensations::ExecutedAt).timestamp_with_time_zone())
                .to_string(PostgresQueryBuilder),
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
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(saga.id)
        .bind(&saga.saga_type)
        .bind(saga.state.as_string())
        .bind(&saga.initial_payload)
        .bind(saga.started_at)
        .bind(saga.ended_at)
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
             FROM saga_log WHERE id = $1",
        )
        .bind(id)
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
            "UPDATE saga_log SET state = $1, ended_at = $2, error_message = $3, version = $4 \
             WHERE id = $5 AND version = $6",
        )
        .bind(saga.state.as_string())
        .bind(saga.ended_at)
        .bind(&saga.error_message)
        .bind(new_version)
        .bind(saga.id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await
        .map_err(|e| SagaError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            let actual: i64 = sqlx::query("SELECT version FROM saga_log WHERE id = $1")
                .bind(saga.id)
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
        let limit = if filter.limit == 0 { 50 } else { filter.limit.min(1000) } as i64;
        let offset = (filter.page as i64).saturating_mul(limit);

        let mut query = String::from(
            "SELECT id, type, state, initial_payload, started_at, ended_at, error_message, timeout_minutes, version \
             FROM saga_log WHERE 1 = 1",
        );
        let mut idx = 1;
        if filter.state.is_some() {
            query.push_str(&format!(" AND state = ${idx}"));
            idx += 1;
        }
        if filter.saga_type.is_some() {
            query.push_str(&format!(" AND type = ${idx}"));
            idx += 1;
        }
        query.push_str(&format!(" ORDER BY started_at DESC LIMIT ${idx} OFFSET ${}", idx + 1));

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

        sqlx::query("DELETE FROM saga_compensations WHERE saga_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;
        sqlx::query("DELETE FROM saga_steps WHERE saga_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;
        sqlx::query("DELETE FROM saga_log WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| SagaError::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| SagaError::Database(e.to_string()))?;
        Ok(())
    }
}

fn row_to_saga_header(row: sqlx::postgres::PgRow) -> Result<Saga> {
    Ok(Saga {
        id: row.try_get("id").map_err(|e| SagaError::Database(e.to_string()))?,
        saga_type: row.try_get("type").map_err(|e| SagaError::Database(e.to_string()))?,
        state: {
            let state: String = row.try_get("state").map_err(|e| SagaError::Database(e.to_string()))?;
            SagaState::parse(&state).map_err(SagaError::Database)?
        },
        initial_payload: row
            .try_get::<Value, _>("initial_payload")
            .map_err(|e| SagaError::Database(e.to_string()))?,
        started_at: row
            .try_get::<DateTime<Utc>, _>("started_at")
            .map_err(|e| SagaError::Database(e.to_string()))?,
        ended_at: row
            .try_get::<Option<DateTime<Utc>>, _>("ended_at")
            .map_err(|e| SagaError::Database(e.to_string()))?,
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

fn row_to_step(row: sqlx::postgres::PgRow) -> Result<Step> {
    let kind: String = row.try_get("kind").map_err(|e| SagaError::Database(e.to_string()))?;
    Ok(Step {
        id: row.try_get("id").map_err(|e| SagaError::Database(e.to_string()))?,
        kind: kind.parse::<StepKind>().map_err(SagaError::Database)?,
        input: row.try_get("input").map_err(|e| SagaError::Database(e.to_string()))?,
        result: row.try_get("result").map_err(|e| SagaError::Database(e.to_string()))?,
        success: row.try_get("success").map_err(|e| SagaError::Database(e.to_string()))?,
        error: row.try_get("error").map_err(|e| SagaError::Database(e.to_string()))?,
        executed_at: row.try_get("executed_at").map_err(|e| SagaError::Database(e.to_string()))?,
    })
}

fn row_to_compensation(row: sqlx::postgres::PgRow) -> Result<Compensation> {
    let kind: String = row.try_get("kind").map_err(|e| SagaError::Database(e.to_string()))?;
    Ok(Compensation {
        id: row.try_get("id").map_err(|e| SagaError::Database(e.to_string()))?,
        step_id: row.try_get("step_id").map_err(|e| SagaError::Database(e.to_string()))?,
        kind: kind.parse::<CompensationKind>().map_err(SagaError::Database)?,
        input: row.try_get("input").map_err(|e| SagaError::Database(e.to_string()))?,
        result: row.try_get("result").map_err(|e| SagaError::Database(e.to_string()))?,
        success: row.try_get("success").map_err(|e| SagaError::Database(e.to_string()))?,
        error: row.try_get("error").map_err(|e| SagaError::Database(e.to_string()))?,
        executed_at: row.try_get("executed_at").map_err(|e| SagaError::Database(e.to_string()))?,
    })
}
