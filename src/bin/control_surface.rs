//! control-surface: the saga orchestrator's operator-facing HTTP API
//! — start/inspect/list/delete sagas and hot-swap the
//! reporting data-service configuration. Does not itself drive the
//! saga engine off the event bus; that is `saga-worker`'s job. This
//! binary still needs a live [`saga_orchestrator::saga::SagaEngine`] to
//! kick off the first `advance()` synchronously on saga creation, the same
//! way the original request handler does before any event is even
//! published.

use std::sync::Arc;

use reqwest::Client;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use saga_orchestrator::config::Config;
use saga_orchestrator::control::data_service_config::DataServiceConfigStore;
use saga_orchestrator::control::{self, ControlApp};
use saga_orchestrator::outbox::OutboxStore;
use saga_orchestrator::participants::{AdapterRegistry, PaymentStatusAdapter};
use saga_orchestrator::saga::{SagaEngine, SagaLogStore};
use saga_orchestrator::utils::bootstrap;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    bootstrap::init_tracing();

    let config = Config::load()?;
    tracing::info!("starting control-surface");

    let (saga_store, outbox, data_service_config): (
        Arc<dyn SagaLogStore>,
        Arc<dyn OutboxStore>,
        Arc<dyn DataServiceConfigStore>,
    ) = build_stores(&config.storage.database_url).await;

    let client = Client::new();
    let timeout = std::time::Duration::from_secs(config.saga.participant_timeout_secs);

    let adapters = Arc::new(AdapterRegistry::new(
        client.clone(),
        config.participants.campaign_service_url.clone(),
        config.participants.payment_service_url.clone(),
        config.participants.report_service_url.clone(),
        data_service_config.clone(),
        timeout,
    ));

    let engine = Arc::new(SagaEngine::new(saga_store.clone(), outbox.clone(), adapters));
    let payment_status = Arc::new(PaymentStatusAdapter::new(
        client,
        config.participants.payment_service_url.clone(),
        timeout,
    ));

    let app = ControlApp {
        engine,
        store: saga_store,
        payment_status,
        data_service_config,
    };

    let router = control::router(app)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.saga.control_surface_port);
    tracing::info!(%addr, "control-surface listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(feature = "sqlite")]
async fn build_stores(
    database_url: &str,
) -> (
    Arc<dyn SagaLogStore>,
    Arc<dyn OutboxStore>,
    Arc<dyn DataServiceConfigStore>,
) {
    use saga_orchestrator::control::data_service_config::SqliteDataServiceConfigStore;
    use saga_orchestrator::outbox::SqliteOutbox;
    use saga_orchestrator::saga::SqliteSagaStore;

    let pool = bootstrap::sqlite_pool(database_url).await;

    let saga_store = SqliteSagaStore::new(pool.clone());
    saga_store.init().await.expect("failed to init saga store");

    let outbox = SqliteOutbox::new(pool.clone(), "control_surface_outbox");
    outbox.init().await.expect("failed to init outbox");

    let data_service_config = SqliteDataServiceConfigStore::new(pool);
    data_service_config.init().await.expect("failed to init data service config store");

    (Arc::new(saga_store), Arc::new(outbox), Arc::new(data_service_config))
}

#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
async fn build_stores(
    database_url: &str,
) -> (
    Arc<dyn SagaLogStore>,
    Arc<dyn OutboxStore>,
    Arc<dyn DataServiceConfigStore>,
) {
    use saga_orchestrator::control::data_service_config::PostgresDataServiceConfigStore;
    use saga_orchestrator::outbox::PostgresOutbox;
    use saga_orchestrator::saga::PostgresSagaStore;

    let pool = bootstrap::postgres_pool(database_url).await;

    let saga_store = PostgresSagaStore::new(pool.clone());
    saga_store.init().await.expect("failed to init saga store");

    let outbox = PostgresOutbox::new(pool.clone(), "control_surface_outbox");
    outbox.init().await.expect("failed to init outbox");

    let data_service_config = PostgresDataServiceConfigStore::new(pool);
    data_service_config.init().await.expect("failed to init data service config store");

    (Arc::new(saga_store), Arc::new(outbox), Arc::new(data_service_config))
}
