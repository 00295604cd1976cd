//! Saga log store: durable saga header, steps, and compensations.
//!
//! Append-oriented on steps/compensations, updatable on the header. `update`
//! rewrites the full step/compensation collections transactionally with the
//! header so no partial step-list is ever observable.

use async_trait::async_trait;
use uuid::Uuid;

use super::model::{Saga, SagaState};

pub type Result<T> = std::result::Result<T, SagaError>;

#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("saga not found: {0}")]
    NotFound(Uuid),
    #[error("saga {id} version conflict: expected {expected}, found {actual}")]
    VersionConflict {
        id: Uuid,
        expected: i64,
        actual: i64,
    },
    #[error("database error: {0}")]
    Database(String),
}

/// Filter + pagination for `list` (backs
/// `GET /saga/?estado&tipo&pagina&limite`).
#[derive(Debug, Clone, Default)]
pub struct SagaListFilter {
    pub state: Option<SagaState>,
    pub saga_type: Option<String>,
    pub page: u32,
    pub limit: u32,
}

#[async_trait]
pub trait SagaLogStore: Send + Sync {
    async fn init(&self) -> Result<()>;

    async fn create(&self, saga: &Saga) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Saga>;

    /// Update the header and fully rewrite the step/compensation
    /// collections. Uses `saga.version` for optimistic concurrency: the
    /// caller must have read-then-modified the same version it is writing
    /// back, or the update is rejected with [`SagaError::VersionConflict`].
    /// A monotonically increasing version column is what makes this safe
    /// under multiple concurrent workers.
    async fn update(&self, saga: &Saga, expected_version: i64) -> Result<()>;

    async fn list_by_state(&self, state: SagaState) -> Result<Vec<Saga>>;

    async fn list_by_type(&self, saga_type: &str) -> Result<Vec<Saga>>;

    /// Sagas whose state is not in {COMPLETED, FAILED, COMPENSATED, TIMED_OUT}.
    async fn list_pending(&self) -> Result<Vec<Saga>>;

    async fn list(&self, filter: &SagaListFilter) -> Result<Vec<Saga>>;

    /// Test-only cleanup endpoint support.
    async fn delete(&self, id: Uuid) -> Result<()>;
}
