//! The saga engine: schedules the next step, invokes the matching
//! participant adapter, records the result, and drives compensation on
//! failure. The hardest part of the system.
//!
//! Forward execution and compensation are implemented as an in-process loop
//! triggered by the event handlers in [`crate::saga::sweeper`] and the bus
//! consumer wired up in `src/bin/saga_worker.rs` — the loop itself still
//! emits every progress event a real broker-backed deployment with
//! multiple workers would observe (`SagaStepExecuted`,
//! `SagaCompensationExecuted`, …) driving a redelivery-based loop.

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::outbox::{NewOutboxRow, OutboxStore};
use crate::participants::{AdapterOutcome, AdapterRegistry};

use super::model::{Saga, SagaState, SagaTopology, Step, StepKind};
use super::store::{SagaError, SagaLogStore};

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Saga(#[from] SagaError),
    #[error("outbox error: {0}")]
    Outbox(#[from] crate::outbox::OutboxError),
}

/// Outcome of resolving the asynchronous `PROCESS_PAYMENT` step: the
/// payment adapter returns `ok-pending` up front, and this is fed back in
/// later by a `PaymentCompleted`/`PaymentFailed` event handler.
#[derive(Debug, Clone)]
pub enum PaymentResolution {
    Completed(Value),
    Failed(String),
}

pub struct SagaEngine {
    store: std::sync::Arc<dyn SagaLogStore>,
    outbox: std::sync::Arc<dyn OutboxStore>,
    adapters: std::sync::Arc<AdapterRegistry>,
}

impl SagaEngine {
    pub fn new(
        store: std::sync::Arc<dyn SagaLogStore>,
        outbox: std::sync::Arc<dyn OutboxStore>,
        adapters: std::sync::Arc<AdapterRegistry>,
    ) -> Self {
        Self { store, outbox, adapters }
    }

    /// Start a new `CreateCompleteCampaign` saga.
    /// Persists the saga with all steps pre-enumerated and emits
    /// `SagaStarted`.
    #[instrument(skip(self, campana, pago, reporte))]
    pub async fn start(&self, campana: Value, pago: Value, reporte: Value, timeout_minutes: i64) -> Result<Uuid> {
        let saga = SagaTopology::new_saga(campana, pago, reporte, timeout_minutes);
        self.store.create(&saga).await?;

        self.emit(
            saga.id,
            "SagaStarted",
            json!({ "saga_id": saga.id, "initial_payload": saga.initial_payload }),
        )
        .await?;

        info!(saga_id = %saga.id, "saga started");
        Ok(saga.id)
    }

    /// Drive one pass of the step-execution loop for `saga_id`. Safe to
    /// call repeatedly/redundantly: a terminal saga is a no-op, and a
    /// step's `success` flag guards re-marking.
    #[instrument(skip(self))]
    pub async fn advance(&self, saga_id: Uuid) -> Result<()> {
        let mut saga = self.store.get(saga_id).await?;
        if saga.state.is_terminal() {
            return Ok(());
        }

        loop {
            let Some(pending) = saga.first_pending_step().cloned() else {
                self.complete(&mut saga).await?;
                return Ok(());
            };

            let adapter = self.adapters.forward(pending.kind);
            let outcome = adapter.invoke(&pending.input).await;

            match outcome {
                AdapterOutcome::Ok(result) => {
                    self.record_step_success(&mut saga, pending.id, result).await?;
                    if saga.state.is_terminal() {
                        return Ok(());
                    }
                    // Loop back to the next pending step.
                }
                AdapterOutcome::Pending { payment_id } => {
                    // Stash the correlation ID without marking the step
                    // successful or failed — the saga sits in this waiting
                    // sub-state until `resolve_payment` is called.
                    self.stash_pending_payment(&mut saga, pending.id, &payment_id).await?;
                    return Ok(());
                }
                AdapterOutcome::Err { reason, retriable } => {
                    if retriable {
                        // Not retried synchronously: leave the
                        // step untouched for the next redelivery/sweep.
                        warn!(saga_id = %saga_id, step = ?pending.kind, reason, "retriable step failure, leaving for redelivery");
                        return Ok(());
                    }
                    self.record_step_failure(&mut saga, pending.id, reason).await?;
                    return Ok(());
                }
            }
        }
    }

    /// Resolve a pending `PROCESS_PAYMENT` step once `PaymentCompleted`/
    /// `PaymentFailed` arrives. Looks up the saga whose
    /// waiting step carries `payment_id`; ACKs (no-op) if none does — the
    /// saga may already be terminal, or this payment belongs to another
    /// saga's redelivered event.
    #[instrument(skip(self, resolution))]
    pub async fn resolve_payment(&self, payment_id: &str, resolution: PaymentResolution) -> Result<()> {
        let Some(mut saga) = self.find_saga_waiting_on_payment(payment_id).await? else {
            return Ok(());
        };
        if saga.state.is_terminal() {
            return Ok(());
        }

        let step_id = saga
            .steps
            .iter()
            .find(|s| s.kind == StepKind::ProcessPayment && s.is_pending())
            .map(|s| s.id);
        let Some(step_id) = step_id else {
            return Ok(());
        };

        match resolution {
            PaymentResolution::Completed(result) => {
                self.record_step_success(&mut saga, step_id, result).await?;
            }
            PaymentResolution::Failed(reason) => {
                self.record_step_failure(&mut saga, step_id, reason).await?;
                return Ok(());
            }
        }

        if !saga.state.is_terminal() {
            self.advance(saga.id).await?;
        }
        Ok(())
    }

    async fn find_saga_waiting_on_payment(&self, payment_id: &str) -> Result<Option<Saga>> {
        let pending = self.store.list_pending().await?;
        Ok(pending.into_iter().find(|saga| {
            saga.steps.iter().any(|s| {
                s.kind == StepKind::ProcessPayment
                    && s.is_pending()
                    && s.result
                        .as_ref()
                        .and_then(|r| r.get("pending_payment_id"))
                        .and_then(Value::as_str)
                        == Some(payment_id)
            })
        }))
    }

    async fn stash_pending_payment(&self, saga: &mut Saga, step_id: Uuid, payment_id: &str) -> Result<()> {
        let expected_version = saga.version;
        if let Some(step) = saga.step_mut(step_id) {
            step.result = Some(json!({ "pending_payment_id": payment_id }));
        }
        self.store.update(saga, expected_version).await?;
        saga.version = expected_version + 1;

        self.emit(
            saga.id,
            "PaymentPending",
            json!({ "saga_id": saga.id, "payment_id": payment_id }),
        )
        .await?;
        Ok(())
    }

    async fn record_step_success(&self, saga: &mut Saga, step_id: Uuid, result: Value) -> Result<()> {
        if let Some(step) = saga.step_mut(step_id) {
            step.mark_success(result.clone());
        }
        saga.advance_after_step_success();

        let expected_version = saga.version;
        self.store.update(saga, expected_version).await?;
        saga.version = expected_version + 1;

        if saga.state == SagaState::Completed {
            self.emit(saga.id, "SagaCompleted", json!({ "saga_id": saga.id })).await?;
            info!(saga_id = %saga.id, "saga completed");
        } else {
            self.emit(
                saga.id,
                "SagaStepExecuted",
                json!({ "saga_id": saga.id, "step_id": step_id, "result": result }),
            )
            .await?;
        }
        Ok(())
    }

    async fn complete(&self, saga: &mut Saga) -> Result<()> {
        if saga.all_steps_succeeded() && saga.state != SagaState::Completed {
            saga.state = SagaState::Completed;
            saga.ended_at = Some(Utc::now());
            let expected_version = saga.version;
            self.store.update(saga, expected_version).await?;
            saga.version = expected_version + 1;
            self.emit(saga.id, "SagaCompleted", json!({ "saga_id": saga.id })).await?;
        }
        Ok(())
    }

    async fn record_step_failure(&self, saga: &mut Saga, step_id: Uuid, error: String) -> Result<()> {
        if let Some(step) = saga.step_mut(step_id) {
            step.mark_failed(error.clone());
        }

        if saga.has_successful_step() {
            saga.enter_compensating(error.clone());
            let expected_version = saga.version;
            self.store.update(saga, expected_version).await?;
            saga.version = expected_version + 1;
            self.emit(saga.id, "SagaFailed", json!({ "saga_id": saga.id, "error": error })).await?;

            self.run_compensations(saga).await?;
        } else {
            saga.fail_without_compensation(error.clone());
            let expected_version = saga.version;
            self.store.update(saga, expected_version).await?;
            saga.version = expected_version + 1;
            self.emit(saga.id, "SagaFailed", json!({ "saga_id": saga.id, "error": error })).await?;
        }
        Ok(())
    }

    /// Walk successfully-completed steps in reverse, invoking the matching
    /// compensation adapter for each. Compensation failures are logged and
    /// persisted but never abort the chain.
    #[instrument(skip(self, saga))]
    pub async fn run_compensations(&self, saga: &mut Saga) -> Result<()> {
        let successful_steps: Vec<Step> = saga.successful_steps_reverse().cloned().collect();

        for step in successful_steps {
            let kind = step.kind.compensation_kind();
            let input = step.result.clone().unwrap_or(Value::Null);
            let adapter = self.adapters.compensation(kind);
            let outcome = adapter.invoke(&input).await;

            let (success, result, error) = match outcome {
                AdapterOutcome::Ok(result) => (true, Some(result), None),
                AdapterOutcome::Pending { payment_id } => (true, Some(json!({ "pending_payment_id": payment_id })), None),
                AdapterOutcome::Err { reason, .. } => {
                    error!(saga_id = %saga.id, step_id = %step.id, kind = kind.as_str(), reason, "compensation failed, continuing chain");
                    (false, None, Some(reason))
                }
            };

            let mut compensation = super::model::Compensation::pending(step.id, kind, input);
            if success {
                compensation.mark_success(result.unwrap_or(Value::Null));
            } else {
                compensation.mark_failed(error.unwrap_or_default());
            }
            let comp_success = compensation.success;
            saga.compensations.push(compensation);

            let expected_version = saga.version;
            self.store.update(saga, expected_version).await?;
            saga.version = expected_version + 1;

            self.emit(
                saga.id,
                "SagaCompensationExecuted",
                json!({ "saga_id": saga.id, "step_id": step.id, "kind": kind.as_str(), "success": comp_success }),
            )
            .await?;
        }

        saga.mark_compensated();
        let expected_version = saga.version;
        self.store.update(saga, expected_version).await?;
        saga.version = expected_version + 1;
        self.emit(saga.id, "SagaCompensated", json!({ "saga_id": saga.id })).await?;
        info!(saga_id = %saga.id, "saga compensated");
        Ok(())
    }

    /// Handle a single saga's timeout, called by
    /// [`crate::saga::sweeper`] for any pending saga whose age exceeds its
    /// `timeout_minutes`. Marks `TIMED_OUT`, emits `SagaTimedOut`, and if at
    /// least one step succeeded, immediately runs the compensation chain
    ///.
    #[instrument(skip(self))]
    pub async fn handle_timeout(&self, saga_id: Uuid) -> Result<()> {
        let mut saga = self.store.get(saga_id).await?;
        if saga.state.is_terminal() || !saga.is_expired(Utc::now()) {
            return Ok(());
        }

        saga.mark_timed_out();
        let expected_version = saga.version;
        self.store.update(&saga, expected_version).await?;
        saga.version = expected_version + 1;
        self.emit(saga.id, "SagaTimedOut", json!({ "saga_id": saga.id })).await?;
        warn!(saga_id = %saga.id, "saga timed out");

        if saga.has_successful_step() {
            saga.enter_compensating("saga timed out");
            let expected_version = saga.version;
            self.store.update(&saga, expected_version).await?;
            saga.version = expected_version + 1;
            self.run_compensations(&mut saga).await?;
        }
        Ok(())
    }

    async fn emit(&self, saga_id: Uuid, event_type: &str, mut data: Value) -> Result<()> {
        if let Value::Object(map) = &mut data {
            map.insert("aggregate_id".to_string(), json!(saga_id.to_string()));
        }
        self.outbox
            .insert_standalone(NewOutboxRow {
                kind: event_type.to_string(),
                payload: data,
                topic: crate::bus::topics::SAGA_EVENTS.to_string(),
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::SqliteOutbox;
    use crate::participants::ParticipantAdapter;
    use crate::saga::store_sqlite::SqliteSagaStore;
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;

    struct FixedOutcome(AdapterOutcome);

    #[async_trait]
    impl ParticipantAdapter for FixedOutcome {
        async fn invoke(&self, _input: &Value) -> AdapterOutcome {
            self.0.clone()
        }
    }

    impl Clone for AdapterOutcome {
        fn clone(&self) -> Self {
            match self {
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

    async fn engine_with(
        campaign: AdapterOutcome,
        payment: AdapterOutcome,
        report: AdapterOutcome,
        cancel_campaign: AdapterOutcome,
        refund_payment: AdapterOutcome,
    ) -> SagaEngine {
        let pool = SqlitePoolOptions::new().connect("sqlite::memory:").await.unwrap();
        let store = SqliteSagaStore::new(pool.clone());
        store.init().await.unwrap();
        let outbox = SqliteOutbox::new(pool, "outbox".to_string());
        outbox.init().await.unwrap();

        let adapters = crate::participants::AdapterRegistry::from_adapters(
            Box::new(FixedOutcome(campaign)),
            Box::new(FixedOutcome(payment)),
            Box::new(FixedOutcome(report)),
            Box::new(FixedOutcome(cancel_campaign)),
            Box::new(FixedOutcome(refund_payment)),
            Box::new(crate::participants::CancelReportAdapter),
        );

        SagaEngine::new(
            std::sync::Arc::new(store),
            std::sync::Arc::new(outbox),
            std::sync::Arc::new(adapters),
        )
    }

    fn ok(v: Value) -> AdapterOutcome {
        AdapterOutcome::Ok(v)
    }

    fn err(reason: &str) -> AdapterOutcome {
        AdapterOutcome::Err {
            reason: reason.to_string(),
            retriable: false,
        }
    }

    /// S1 — happy path: all three participants succeed synchronously.
    #[tokio::test]
    async fn happy_path_completes() {
        let engine = engine_with(
            ok(json!({"id": "c-1"})),
            ok(json!({"id": "p-1"})),
            ok(json!({"id": "r-1"})),
            ok(json!({})),
            ok(json!({})),
        )
        .await;

        let saga_id = engine
            .start(json!({"nombre": "Promo"}), json!({"monto": 1000}), json!({}), 30)
            .await
            .unwrap();
        engine.advance(saga_id).await.unwrap();

        let saga = engine.store.get(saga_id).await.unwrap();
        assert_eq!(saga.state, SagaState::Completed);
        assert!(saga.steps.iter().all(|s| s.success));
        assert!(saga.compensations.is_empty());
    }

    /// S3 — first step fails: terminal FAILED, zero compensations.
    #[tokio::test]
    async fn first_step_fails_no_compensation() {
        let engine = engine_with(
            err("campaign rejected"),
            ok(json!({})),
            ok(json!({})),
            ok(json!({})),
            ok(json!({})),
        )
        .await;

        let saga_id = engine.start(json!({}), json!({}), json!({}), 30).await.unwrap();
        engine.advance(saga_id).await.unwrap();

        let saga = engine.store.get(saga_id).await.unwrap();
        assert_eq!(saga.state, SagaState::Failed);
        assert!(saga.compensations.is_empty());
    }

    /// S2 — payment fails after campaign succeeds: compensates the campaign.
    #[tokio::test]
    async fn payment_fails_compensates_campaign() {
        let engine = engine_with(
            ok(json!({"id": "c-1"})),
            err("payment rejected"),
            ok(json!({})),
            ok(json!({"cancelled": true})),
            ok(json!({})),
        )
        .await;

        let saga_id = engine
            .start(json!({}), json!({}), json!({}), 30)
            .await
            .unwrap();
        engine.advance(saga_id).await.unwrap();

        let saga = engine.store.get(saga_id).await.unwrap();
        assert_eq!(saga.state, SagaState::Compensated);
        assert_eq!(saga.compensations.len(), 1);
        assert_eq!(saga.compensations[0].kind, super::super::model::CompensationKind::CancelCampaign);
        assert!(saga.compensations[0].success);
        // Report step never executes: only two of three steps are resolved.
        assert!(!saga.steps[2].success && saga.steps[2].error.is_none());
    }

    /// S4 — duplicate PaymentCompleted delivery: the step succeeds exactly
    /// once; resolving twice is a no-op the second time.
    #[tokio::test]
    async fn duplicate_payment_completion_is_idempotent() {
        let engine = engine_with(
            ok(json!({"id": "c-1"})),
            AdapterOutcome::Pending {
                payment_id: "pay-1".to_string(),
            },
            ok(json!({"id": "r-1"})),
            ok(json!({})),
            ok(json!({})),
        )
        .await;

        let saga_id = engine.start(json!({}), json!({}), json!({}), 30).await.unwrap();
        engine.advance(saga_id).await.unwrap();

        let waiting = engine.store.get(saga_id).await.unwrap();
        let payment_step = waiting
            .steps
            .iter()
            .find(|s| s.kind == StepKind::ProcessPayment)
            .unwrap();
        assert!(payment_step.is_pending());

        engine
            .resolve_payment("pay-1", PaymentResolution::Completed(json!({"id": "pay-1"})))
            .await
            .unwrap();
        engine
            .resolve_payment("pay-1", PaymentResolution::Completed(json!({"id": "pay-1-dup"})))
            .await
            .unwrap();

        let saga = engine.store.get(saga_id).await.unwrap();
        let payment_step = saga.steps.iter().find(|s| s.kind == StepKind::ProcessPayment).unwrap();
        assert_eq!(payment_step.result, Some(json!({"id": "pay-1"})));
        assert_eq!(saga.state, SagaState::Completed);
    }

    /// Compensation failure is logged but does not abort the chain.
    #[tokio::test]
    async fn compensation_failure_does_not_abort_chain() {
        let engine = engine_with(
            ok(json!({"id": "c-1"})),
            err("payment rejected"),
            ok(json!({})),
            err("cancel endpoint down"),
            ok(json!({})),
        )
        .await;

        let saga_id = engine.start(json!({}), json!({}), json!({}), 30).await.unwrap();
        engine.advance(saga_id).await.unwrap();

        let saga = engine.store.get(saga_id).await.unwrap();
        assert_eq!(saga.state, SagaState::Compensated);
        assert_eq!(saga.compensations.len(), 1);
        assert!(!saga.compensations[0].success);
    }
}
