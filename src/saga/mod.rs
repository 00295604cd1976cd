//! Saga orchestrator core: the saga data model, its durable log
//! store, and the engine that drives forward execution and compensation.

pub mod engine;
pub mod model;
#[cfg(feature = "postgres")]
pub mod store_postgres;
#[cfg(feature = "sqlite")]
pub mod store_sqlite;
pub mod sweeper;

pub mod store;

pub use engine::SagaEngine;
pub use model::{Compensation, CompensationKind, Saga, SagaState, SagaTopology, Step, StepKind};
#[cfg(feature = "postgres")]
pub use store_postgres::PostgresSagaStore;
#[cfg(feature = "sqlite")]
pub use store_sqlite::SqliteSagaStore;
pub use store::{SagaError, SagaListFilter, SagaLogStore};
pub use sweeper::{spawn_sweeper, sweep_once, SweeperConfig, SweeperHandle};
