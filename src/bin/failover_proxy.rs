//! failover-proxy: active-passive reverse proxy in front of the campaign
//! service — forwards `/api/<service>/*path` to whichever
//! upstream is currently active, probing both continuously and cutting
//! over per the hysteresis rule in [`saga_orchestrator::proxy::state`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tower_http::trace::TraceLayer;

use saga_orchestrator::config::Config;
use saga_orchestrator::proxy::{spawn_health_probes, HealthProbeConfig, ProxyApp, ProxyState};
use saga_orchestrator::utils::bootstrap;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    bootstrap::init_tracing();

    let config = Config::load()?;
    tracing::info!("starting failover-proxy");

    let state = Arc::new(ProxyState::new(
        config.proxy.primary_service_url.clone(),
        config.proxy.replica_service_url.clone(),
        config.proxy.max_consecutive_failures,
    ));

    let client = Client::builder()
        .timeout(saga_orchestrator::proxy::DEFAULT_FORWARD_TIMEOUT)
        .build()?;

    spawn_health_probes(
        state.clone(),
        client.clone(),
        HealthProbeConfig {
            health_path: config.proxy.health_path.clone(),
            interval: Duration::from_secs(config.proxy.health_check_interval_secs),
            timeout: Duration::from_secs(config.proxy.health_check_timeout_secs),
        },
    );

    let app = ProxyApp { state, client };
    let router = saga_orchestrator::proxy::router(app).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.proxy.listen_port);
    tracing::info!(%addr, "failover-proxy listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
