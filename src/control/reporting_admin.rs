//! Reporting data-service admin surface: hot-swap the URL/version the
//! `GENERATE_REPORT` step calls, without restarting any worker.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::control::data_service_config::DataServiceConfig;
use crate::error::AppError;

use super::ControlApp;

pub fn router(app: ControlApp) -> Router {
    Router::new()
        .route("/reporting/admin/servicio-datos", post(activate))
        .route("/reporting/admin/configuracion", get(configuracion))
        .with_state(app)
}

#[derive(Deserialize)]
struct ActivateRequest {
    url: String,
    version: String,
}

async fn activate(
    State(app): State<ControlApp>,
    Json(req): Json<ActivateRequest>,
) -> Result<Json<DataServiceConfig>, AppError> {
    let config = app.data_service_config.activate(req.url, req.version).await?;
    Ok(Json(config))
}

#[derive(Serialize)]
struct ConfiguracionResponse {
    activa: Option<DataServiceConfig>,
    historial: Vec<DataServiceConfig>,
}

async fn configuracion(State(app): State<ControlApp>) -> Result<Json<ConfiguracionResponse>, AppError> {
    let activa = app.data_service_config.get_active().await?;
    let historial = app.data_service_config.history().await?;
    Ok(Json(ConfiguracionResponse { activa, historial }))
}
