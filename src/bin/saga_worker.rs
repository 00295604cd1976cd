//! saga-worker: drives the `CreateCompleteCampaign` saga engine off the
//! event bus — advances newly-started sagas, resolves
//! payment steps once `PaymentCompleted`/`PaymentFailed` arrive, drains
//! this service's own outbox, and runs the timeout sweeper.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use saga_orchestrator::bus::{topics, Ack, ChannelEventBus, EventBus, EventEnvelope, EventHandler, SubscriptionMode};
use saga_orchestrator::config::Config;
use saga_orchestrator::control::data_service_config::DataServiceConfigStore;
use saga_orchestrator::inbox::{InboxStore, SeenStatus};
use saga_orchestrator::outbox::{spawn_drainer, DrainerConfig, OutboxStore};
use saga_orchestrator::participants::AdapterRegistry;
use saga_orchestrator::saga::engine::PaymentResolution;
use saga_orchestrator::saga::{spawn_sweeper, SagaEngine, SagaLogStore, SweeperConfig};
use saga_orchestrator::utils::bootstrap;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    bootstrap::init_tracing();

    let config = Config::load()?;
    info!("starting saga-worker");

    let (saga_store, outbox, inbox, data_service_config) = build_stores(&config.storage.database_url).await;

    let client = Client::new();
    let timeout = std::time::Duration::from_secs(config.saga.participant_timeout_secs);
    let adapters = Arc::new(AdapterRegistry::new(
        client,
        config.participants.campaign_service_url.clone(),
        config.participants.payment_service_url.clone(),
        config.participants.report_service_url.clone(),
        data_service_config,
        timeout,
    ));

    let engine = Arc::new(SagaEngine::new(saga_store.clone(), outbox.clone(), adapters));

    let bus: Arc<dyn EventBus> = Arc::new(ChannelEventBus::new(config.bus.max_redeliver_count));

    let handler = Arc::new(SagaEventHandler {
        engine: engine.clone(),
        inbox,
    });

    bus.subscribe(topics::SAGA_EVENTS, "saga-worker", SubscriptionMode::Shared, handler.clone())
        .await?;
    bus.subscribe(topics::PAYMENTS_EVENTS, "saga-worker", SubscriptionMode::Shared, handler)
        .await?;

    let _drainer = spawn_drainer(
        outbox,
        bus,
        DrainerConfig {
            poll_interval: std::time::Duration::from_millis(config.saga.outbox_poll_interval_millis),
            batch_size: config.saga.outbox_batch_size,
            ..Default::default()
        },
    );

    let _sweeper = spawn_sweeper(
        saga_store,
        engine,
        SweeperConfig {
            interval: std::time::Duration::from_secs(config.saga.sweeper_interval_secs),
        },
    );

    info!("saga-worker running, press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    Ok(())
}

/// Bridges the event bus to the saga engine: `SagaStarted` kicks off the
/// forward-execution loop, `PaymentCompleted`/`PaymentFailed` resolve the
/// waiting `PROCESS_PAYMENT` step. Dedups against the inbox
/// by the envelope's `event_id` before touching the engine.
struct SagaEventHandler {
    engine: Arc<SagaEngine>,
    inbox: Arc<dyn InboxStore>,
}

#[async_trait]
impl EventHandler for SagaEventHandler {
    async fn handle(&self, envelope: Arc<EventEnvelope>) -> Ack {
        match self.inbox.seen_or_mark(envelope.event_id, &envelope.event_type, &envelope.data).await {
            Ok(SeenStatus::Duplicate) => return Ack::Ack,
            Ok(SeenStatus::First) => {}
            Err(e) => {
                warn!(error = %e, event_id = %envelope.event_id, "inbox check failed, nacking for redelivery");
                return Ack::Nack;
            }
        }

        let result = match envelope.event_type.as_str() {
            "SagaStarted" => self.handle_saga_started(&envelope.data).await,
            "PaymentCompleted" => self.handle_payment_resolution(&envelope.data, true).await,
            "PaymentFailed" => self.handle_payment_resolution(&envelope.data, false).await,
            other => {
                warn!(event_type = other, "saga-worker received an event it does not handle");
                Ok(())
            }
        };

        match result {
            Ok(()) => Ack::Ack,
            Err(e) => {
                warn!(error = %e, event_id = %envelope.event_id, "saga engine error, nacking for redelivery");
                Ack::Nack
            }
        }
    }
}

impl SagaEventHandler {
    async fn handle_saga_started(&self, data: &Value) -> saga_orchestrator::saga::engine::Result<()> {
        let Some(saga_id) = data.get("saga_id").and_then(Value::as_str).and_then(|s| Uuid::parse_str(s).ok()) else {
            warn!("SagaStarted event missing saga_id");
            return Ok(());
        };
        self.engine.advance(saga_id).await
    }

    async fn handle_payment_resolution(&self, data: &Value, completed: bool) -> saga_orchestrator::saga::engine::Result<()> {
        let Some(payment_id) = data.get("payment_id").and_then(Value::as_str) else {
            warn!("payment event missing payment_id");
            return Ok(());
        };

        let resolution = if completed {
            PaymentResolution::Completed(data.clone())
        } else {
            let reason = data
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("payment failed")
                .to_string();
            PaymentResolution::Failed(reason)
        };

        self.engine.resolve_payment(payment_id, resolution).await
    }
}

#[cfg(feature = "sqlite")]
async fn build_stores(
    database_url: &str,
) -> (
    Arc<dyn SagaLogStore>,
    Arc<dyn OutboxStore>,
    Arc<dyn InboxStore>,
    Arc<dyn DataServiceConfigStore>,
) {
    use saga_orchestrator::control::data_service_config::SqliteDataServiceConfigStore;
    use saga_orchestrator::inbox::SqliteInbox;
    use saga_orchestrator::outbox::SqliteOutbox;
    use saga_orchestrator::saga::SqliteSagaStore;

    let pool = bootstrap::sqlite_pool(database_url).await;

    let saga_store = SqliteSagaStore::new(pool.clone());
    saga_store.init().await.expect("failed to init saga store");

    let outbox = SqliteOutbox::new(pool.clone(), "saga_worker_outbox");
    outbox.init().await.expect("failed to init outbox");

    let inbox = SqliteInbox::new(pool.clone(), "saga_worker_inbox");
    inbox.init().await.expect("failed to init inbox");

    let data_service_config = SqliteDataServiceConfigStore::new(pool);
    data_service_config.init().await.expect("failed to init data service config store");

    (
        Arc::new(saga_store),
        Arc::new(outbox),
        Arc::new(inbox),
        Arc::new(data_service_config),
    )
}

#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
async fn build_stores(
    database_url: &str,
) -> (
    Arc<dyn SagaLogStore>,
    Arc<dyn OutboxStore>,
    Arc<dyn InboxStore>,
    Arc<dyn DataServiceConfigStore>,
) {
    use saga_orchestrator::control::data_service_config::PostgresDataServiceConfigStore;
    use saga_orchestrator::inbox::PostgresInbox;
    use saga_orchestrator::outbox::PostgresOutbox;
    use saga_orchestrator::saga::PostgresSagaStore;

    let pool = bootstrap::postgres_pool(database_url).await;

    let saga_store = PostgresSagaStore::new(pool.clone());
    saga_store.init().await.expect("failed to init saga store");

    let outbox = PostgresOutbox::new(pool.clone(), "saga_worker_outbox");
    outbox.init().await.expect("failed to init outbox");

    let inbox = PostgresInbox::new(pool.clone(), "saga_worker_inbox");
    inbox.init().await.expect("failed to init inbox");

    let data_service_config = PostgresDataServiceConfigStore::new(pool);
    data_service_config.init().await.expect("failed to init data service config store");

    (
        Arc::new(saga_store),
        Arc::new(outbox),
        Arc::new(inbox),
        Arc::new(data_service_config),
    )
}
