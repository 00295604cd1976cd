//! event-collector: tracking-event ingress — validates,
//! deduplicates, rate-limits, and publishes CLICK/IMPRESSION/CONVERSION/
//! PAGE_VIEW events to the event bus. Affiliate/campaign directories are
//! out of scope; this binary runs against
//! [`saga_orchestrator::collector::PermissiveDirectory`] for standalone use.

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use saga_orchestrator::bus::{ChannelEventBus, EventBus};
use saga_orchestrator::collector::http::{CollectorApp, EventLog};
use saga_orchestrator::collector::{AffiliateDirectory, CampaignDirectory, InMemoryCollectorStore, PermissiveDirectory};
#[cfg(feature = "redis")]
use saga_orchestrator::collector::RedisCollectorStore;
use saga_orchestrator::config::Config;
use saga_orchestrator::utils::bootstrap;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    bootstrap::init_tracing();

    let config = Config::load()?;
    tracing::info!("starting event-collector");

    let bus: Arc<dyn EventBus> = Arc::new(ChannelEventBus::new(config.bus.max_redeliver_count));

    let affiliates: Arc<dyn AffiliateDirectory> = Arc::new(PermissiveDirectory::default());
    let campaigns: Arc<dyn CampaignDirectory> = Arc::new(PermissiveDirectory::default());

    let (dedup, rate_limit) = build_stores(&config).await;

    let app = CollectorApp {
        bus,
        affiliates,
        campaigns,
        dedup,
        rate_limit,
        rate_limit_window_secs: config.collector.rate_limit_window_secs,
        log: Arc::new(EventLog::default()),
    };

    let router = saga_orchestrator::collector::http::router(app)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.collector.listen_port);
    tracing::info!(%addr, "event-collector listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(feature = "redis")]
async fn build_stores(
    config: &Config,
) -> (
    Arc<dyn saga_orchestrator::collector::DedupStore>,
    Arc<dyn saga_orchestrator::collector::RateLimitStore>,
) {
    if config.collector.use_redis {
        let store = Arc::new(
            RedisCollectorStore::connect(&config.collector.redis_host, config.collector.redis_port)
                .await
                .expect("failed to connect to redis"),
        );
        return (store.clone(), store);
    }
    let store = Arc::new(InMemoryCollectorStore::default());
    (store.clone(), store)
}

#[cfg(not(feature = "redis"))]
async fn build_stores(
    _config: &Config,
) -> (
    Arc<dyn saga_orchestrator::collector::DedupStore>,
    Arc<dyn saga_orchestrator::collector::RateLimitStore>,
) {
    let store = Arc::new(InMemoryCollectorStore::default());
    (store.clone(), store)
}
