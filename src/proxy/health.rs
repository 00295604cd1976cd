//! Background health-probe loop for the failover proxy.
//!
//! Calls `GET <upstream>/<health-path>` on both upstreams in parallel every
//! `interval`, feeding each boolean result into [`ProxyState::record_probe`].

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::{info, warn};

use super::state::{ProxyState, Upstream};

#[derive(Debug, Clone)]
pub struct HealthProbeConfig {
    pub health_path: String,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for HealthProbeConfig {
    fn default() -> Self {
        Self {
            health_path: "/health".to_string(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
        }
    }
}

async fn probe_once(client: &Client, base_url: &str, path: &str, timeout: Duration) -> bool {
    let url = format!("{base_url}{path}");
    match client.get(&url).timeout(timeout).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

/// Spawn the probe loop as a background task. Runs until the process exits
/// — there is no graceful-stop handle because proxy replicas are expected
/// to run for the lifetime of the process; proxy state is per-process and
/// not shared across replicas.
pub fn spawn_health_probes(state: Arc<ProxyState>, client: Client, config: HealthProbeConfig) {
    tokio::spawn(async move {
        loop {
            let (primary_healthy, replica_healthy) = tokio::join!(
                probe_once(&client, state.base_url(Upstream::Primary), &config.health_path, config.timeout),
                probe_once(&client, state.base_url(Upstream::Replica), &config.health_path, config.timeout),
            );

            if let Some(new_active) = state.record_probe(Upstream::Primary, primary_healthy) {
                warn!(new_active = new_active.as_str(), "proxy cutover: primary unhealthy");
            }
            if let Some(new_active) = state.record_probe(Upstream::Replica, replica_healthy) {
                warn!(new_active = new_active.as_str(), "proxy cutover: replica unhealthy");
            }

            info!(primary_healthy, replica_healthy, active = state.active().as_str(), "health probe cycle");

            tokio::time::sleep(config.interval).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_against_unreachable_host_is_unhealthy() {
        let client = Client::new();
        let healthy = probe_once(&client, "http://127.0.0.1:1", "/health", Duration::from_millis(200)).await;
        assert!(!healthy);
    }
}
