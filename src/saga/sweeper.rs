//! Timeout sweeper: a periodic background task that lists pending sagas
//! and times out any whose age exceeds their `timeout_minutes`, driving
//! the same compensation chain a business step failure would.
//!
//! Unlike the outbox drainer and the bus consumer, the sweeper never
//! retries synchronously beyond its own poll loop — a saga that is already
//! mid-compensation from a previous sweep is simply terminal by the time
//! the next pass sees it ([`crate::saga::engine::SagaEngine::handle_timeout`]
//! is a no-op for terminal sagas).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::error;

use super::engine::SagaEngine;
use super::store::SagaLogStore;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Handle to a running sweeper task; dropping it does not stop the task —
/// call [`SweeperHandle::stop`] explicitly for graceful shutdown.
pub struct SweeperHandle {
    stop_tx: watch::Sender<bool>,
}

impl SweeperHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Run a single sweep pass: list pending sagas and time out any that have
/// exceeded their deadline.
pub async fn sweep_once(store: &dyn SagaLogStore, engine: &SagaEngine) {
    let pending = match store.list_pending().await {
        Ok(sagas) => sagas,
        Err(e) => {
            error!(error = %e, "sweeper failed to list pending sagas");
            return;
        }
    };

    let now = Utc::now();
    for saga in pending {
        if saga.is_expired(now) {
            if let Err(e) = engine.handle_timeout(saga.id).await {
                error!(error = %e, saga_id = %saga.id, "sweeper failed to time out saga");
            }
        }
    }
}

/// Spawn the sweeper loop as a background task.
pub fn spawn_sweeper(store: Arc<dyn SagaLogStore>, engine: Arc<SagaEngine>, config: SweeperConfig) -> SweeperHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(config.interval) => {}
            }
            if *stop_rx.borrow() {
                break;
            }
            sweep_once(store.as_ref(), engine.as_ref()).await;
        }
    });

    SweeperHandle { stop_tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::SqliteOutbox;
    use crate::participants::{AdapterOutcome, AdapterRegistry, CancelReportAdapter, ParticipantAdapter};
    use crate::saga::model::SagaState;
    use crate::saga::store_sqlite::SqliteSagaStore;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use sqlx::sqlite::SqlitePoolOptions;

    struct FixedOutcome(AdapterOutcome);

    #[async_trait]
    impl ParticipantAdapter for FixedOutcome {
        async fn invoke(&self, _input: &Value) -> AdapterOutcome {
            match &self.0 {
                AdapterOutcome::Ok(v) => AdapterOutcome::Ok(v.clone()),
                AdapterOutcome::Pending { payment_id } => AdapterOutcome::Pending {
                    payment_id: payment_id.clone(),
                },
                AdapterOutcome::Err { reason, retriable } => AdapterOutcome::Err {
                    reason: reason.clone(),
                    retriable: *retriable,
                },
            }
        }
    }

    async fn engine_and_store() -> (Arc<SqliteSagaStore>, Arc<SagaEngine>) {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let store = Arc::new(SqliteSagaStore::new(pool.clone()));
        store.init().await.unwrap();
        let outbox = Arc::new(SqliteOutbox::new(pool, "outbox".to_string()));
        outbox.init().await.unwrap();

        let adapters = Arc::new(AdapterRegistry::from_adapters(
            Box::new(FixedOutcome(AdapterOutcome::Ok(json!({"id": "c-1"})))),
            Box::new(FixedOutcome(AdapterOutcome::Pending {
                payment_id: "pay-1".to_string(),
            })),
            Box::new(FixedOutcome(AdapterOutcome::Ok(json!({})))),
            Box::new(FixedOutcome(AdapterOutcome::Ok(json!({"cancelled": true})))),
            Box::new(FixedOutcome(AdapterOutcome::Ok(json!({})))),
            Box::new(CancelReportAdapter),
        ));

        let engine = Arc::new(SagaEngine::new(store.clone(), outbox, adapters));
        (store, engine)
    }

    /// Timeout mid-flight: campaign succeeds, the payment step never
    /// resolves. A zero-minute timeout makes the saga immediately expired;
    /// sweeping it compensates the already-successful campaign step.
    #[tokio::test]
    async fn timeout_mid_flight_compensates_successful_step() {
        let (store, engine) = engine_and_store().await;

        let saga_id = engine.start(json!({}), json!({}), json!({}), 0).await.unwrap();
        engine.advance(saga_id).await.unwrap();

        sweep_once(store.as_ref(), engine.as_ref()).await;

        let saga = store.get(saga_id).await.unwrap();
        assert_eq!(saga.state, SagaState::Compensated);
        assert_eq!(saga.compensations.len(), 1);
        assert!(saga.compensations[0].success);
    }

    #[tokio::test]
    async fn non_expired_saga_is_left_alone() {
        let (store, engine) = engine_and_store().await;
        let saga_id = engine.start(json!({}), json!({}), json!({}), 30).await.unwrap();
        engine.advance(saga_id).await.unwrap();

        sweep_once(store.as_ref(), engine.as_ref()).await;

        let saga = store.get(saga_id).await.unwrap();
        assert_ne!(saga.state, SagaState::TimedOut);
    }

    #[tokio::test]
    async fn sweeping_a_saga_with_no_successful_steps_leaves_it_timed_out() {
        let (store, engine) = engine_and_store().await;
        // Every adapter rejects, so nothing succeeds before the sweep runs.
        let rejecting = Arc::new(AdapterRegistry::from_adapters(
            Box::new(FixedOutcome(AdapterOutcome::Err {
                reason: "unreachable in this test".to_string(),
                retriable: true,
            })),
            Box::new(FixedOutcome(AdapterOutcome::Err {
                reason: "unreachable".to_string(),
                retriable: true,
            })),
            Box::new(FixedOutcome(AdapterOutcome::Ok(json!({})))),
            Box::new(FixedOutcome(AdapterOutcome::Ok(json!({})))),
            Box::new(FixedOutcome(AdapterOutcome::Ok(json!({})))),
            Box::new(CancelReportAdapter),
        ));
        let outbox = Arc::new(SqliteOutbox::new(
            sqlx::sqlite::SqlitePoolOptions::new()
                .connect("sqlite::memory:")
                .await
                .unwrap(),
            "outbox".to_string(),
        ));
        outbox.init().await.unwrap();
        let engine2 = Arc::new(SagaEngine::new(store.clone(), outbox, rejecting));

        let saga_id = engine2.start(json!({}), json!({}), json!({}), 0).await.unwrap();
        // advance() on a retriable failure leaves the step untouched — no
        // step ever succeeds, so the sweep has nothing to compensate.
        engine2.advance(saga_id).await.unwrap();
        let _ = &engine;

        sweep_once(store.as_ref(), engine2.as_ref()).await;

        let saga = store.get(saga_id).await.unwrap();
        assert_eq!(saga.state, SagaState::TimedOut);
        assert!(saga.compensations.is_empty());
    }
}
