//! Control surface: the operator-facing HTTP API — start/inspect/list
//! sagas, and hot-swap the reporting data-service configuration. Runs as
//! its own binary (`control-surface`), separate from the saga worker that
//! actually drives the engine off the event bus.

pub mod data_service_config;
pub mod reporting_admin;
pub mod saga_routes;

use std::sync::Arc;

use axum::Router;

use crate::control::data_service_config::DataServiceConfigStore;
use crate::participants::PaymentStatusLookup;
use crate::saga::{SagaEngine, SagaLogStore};

/// Shared state for every control-surface handler.
#[derive(Clone)]
pub struct ControlApp {
    pub engine: Arc<SagaEngine>,
    pub store: Arc<dyn SagaLogStore>,
    pub payment_status: Arc<dyn PaymentStatusLookup>,
    pub data_service_config: Arc<dyn DataServiceConfigStore>,
}

/// The combined saga-admin + reporting-admin router.
pub fn router(app: ControlApp) -> Router {
    Router::new().merge(saga_routes::router(app.clone())).merge(reporting_admin::router(app))
}
