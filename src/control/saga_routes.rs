//! Saga admin HTTP surface: start a
//! `CreateCompleteCampaign` saga, inspect its status, list/filter sagas,
//! delete a saga's log (test/ops cleanup), and manually reconcile a saga
//! stuck waiting on a payment that never arrived via the event bus.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::AppError;
use crate::participants::{PaymentLookupOutcome, PaymentStatusLookup};
use crate::saga::engine::PaymentResolution;
use crate::saga::{Saga, SagaListFilter, SagaLogStore, SagaState};

use super::ControlApp;

pub fn router(app: ControlApp) -> Router {
    Router::new()
        .route("/saga/crear-campana-completa", post(start_saga))
        .route("/saga/:id/status", get(status))
        .route("/saga/", get(list))
        .route("/saga/:id", delete(delete_saga))
        .route("/saga/:id/sync-pago/:payment_id", post(sync_payment))
        .with_state(app)
}

#[derive(Deserialize)]
struct StartSagaRequest {
    campana: Value,
    pago: Value,
    reporte: Value,
    timeout_minutos: i64,
}

#[derive(Serialize)]
struct StartSagaResponse {
    id: Uuid,
}

async fn start_saga(
    State(app): State<ControlApp>,
    Json(req): Json<StartSagaRequest>,
) -> Result<Json<StartSagaResponse>, AppError> {
    let id = app
        .engine
        .start(req.campana, req.pago, req.reporte, req.timeout_minutos)
        .await?;
    app.engine.advance(id).await?;
    Ok(Json(StartSagaResponse { id }))
}

/// Wire representation of a [`Saga`] — `Saga`/`SagaState` carry no `Serialize`
/// impl of their own since the engine only ever needs the typed form
/// in-process; this is the one place a saga crosses the HTTP boundary.
#[derive(Serialize)]
struct SagaView {
    id: Uuid,
    saga_type: String,
    state: String,
    initial_payload: Value,
    started_at: chrono::DateTime<chrono::Utc>,
    ended_at: Option<chrono::DateTime<chrono::Utc>>,
    error_message: Option<String>,
    timeout_minutes: i64,
    version: i64,
    steps: Value,
    compensations: Value,
}

impl From<Saga> for SagaView {
    fn from(saga: Saga) -> Self {
        Self {
            id: saga.id,
            saga_type: saga.saga_type,
            state: saga.state.as_string(),
            initial_payload: saga.initial_payload,
            started_at: saga.started_at,
            ended_at: saga.ended_at,
            error_message: saga.error_message,
            timeout_minutes: saga.timeout_minutes,
            version: saga.version,
            steps: serde_json::to_value(&saga.steps).unwrap_or(Value::Null),
            compensations: serde_json::to_value(&saga.compensations).unwrap_or(Value::Null),
        }
    }
}

async fn status(State(app): State<ControlApp>, Path(id): Path<Uuid>) -> Result<Json<SagaView>, AppError> {
    let saga = app.store.get(id).await?;
    Ok(Json(saga.into()))
}

#[derive(Deserialize)]
struct ListQuery {
    estado: Option<String>,
    tipo: Option<String>,
    pagina: Option<u32>,
    limite: Option<u32>,
}

async fn list(State(app): State<ControlApp>, Query(query): Query<ListQuery>) -> Result<Json<Vec<SagaView>>, AppError> {
    let state = query
        .estado
        .map(|s| SagaState::parse(&s))
        .transpose()
        .map_err(AppError::Validation)?;

    let filter = SagaListFilter {
        state,
        saga_type: query.tipo,
        page: query.pagina.unwrap_or(0),
        limit: query.limite.unwrap_or(0),
    };

    let sagas = app.store.list(&filter).await?;
    Ok(Json(sagas.into_iter().map(SagaView::from).collect()))
}

async fn delete_saga(State(app): State<ControlApp>, Path(id): Path<Uuid>) -> Result<(), AppError> {
    app.store.delete(id).await?;
    Ok(())
}

/// `POST /saga/{id}/sync-pago/{payment_id}`: polls the payment service
/// directly for `payment_id`'s current status and resolves the saga's
/// waiting `PROCESS_PAYMENT` step accordingly — for an operator reconciling
/// a saga stuck because the `PaymentCompleted`/`PaymentFailed` event was
/// lost or never published.
async fn sync_payment(
    State(app): State<ControlApp>,
    Path((id, payment_id)): Path<(Uuid, String)>,
) -> Result<Json<SagaView>, AppError> {
    match app.payment_status.lookup(&payment_id).await {
        PaymentLookupOutcome::Completed(result) => {
            app.engine
                .resolve_payment(&payment_id, PaymentResolution::Completed(result))
                .await?;
        }
        PaymentLookupOutcome::Failed(reason) => {
            app.engine
                .resolve_payment(&payment_id, PaymentResolution::Failed(reason))
                .await?;
        }
        PaymentLookupOutcome::StillPending => {}
        PaymentLookupOutcome::Err(reason) => return Err(AppError::UpstreamUnreachable(reason)),
    }

    let saga = app.store.get(id).await?;
    Ok(Json(saga.into()))
}
