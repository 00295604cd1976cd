//! The outbox drainer: a background task that publishes unsent outbox rows.
//!
//! Polls for unpublished rows, publishes each to the event bus, and marks it
//! processed. Poll interval backs off (doubling, capped) across consecutive
//! empty cycles so an idle service isn't hammering its own database.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error};

use super::OutboxStore;
use crate::bus::{EventBus, EventEnvelope, PublishProperties};

#[derive(Debug, Clone)]
pub struct DrainerConfig {
    pub poll_interval: Duration,
    pub batch_size: u32,
    pub max_empty_backoff: Duration,
}

impl Default for DrainerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            max_empty_backoff: Duration::from_secs(10),
        }
    }
}

/// Handle to a running drainer task; dropping it does not stop the task —
/// call [`DrainerHandle::stop`] explicitly for graceful shutdown.
pub struct DrainerHandle {
    stop_tx: watch::Sender<bool>,
}

impl DrainerHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// Spawn the drainer loop as a background task.
pub fn spawn_drainer(
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    config: DrainerConfig,
) -> DrainerHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut empty_cycles: u32 = 0;

        loop {
            let delay = next_delay(&config, empty_cycles);

            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        debug!("outbox drainer stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if *stop_rx.borrow() {
                break;
            }

            match store.select_pending(config.batch_size).await {
                Ok(rows) if rows.is_empty() => {
                    empty_cycles = empty_cycles.saturating_add(1);
                }
                Ok(rows) => {
                    empty_cycles = 0;
                    for row in rows {
                        let key = row.partition_key();
                        let envelope = EventEnvelope {
                            schema_version: "v1".to_string(),
                            event_type: row.kind.clone(),
                            event_id: row.id,
                            timestamp: row.created_at,
                            data: row.payload.clone(),
                        };
                        let properties =
                            PublishProperties::for_envelope(&envelope).with("aggregate_id", key.clone());

                        match bus.publish(&row.topic, &key, envelope, properties).await {
                            Ok(()) => {
                                if let Err(e) = store.mark_processed(row.id, Utc::now()).await {
                                    error!(error = %e, row_id = %row.id, "failed to mark outbox row processed");
                                }
                            }
                            Err(e) => {
                                error!(error = %e, row_id = %row.id, topic = %row.topic, "outbox publish failed, will retry next tick");
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "outbox select_pending failed");
                }
            }
        }
    });

    DrainerHandle { stop_tx }
}

fn next_delay(config: &DrainerConfig, empty_cycles: u32) -> Duration {
    let multiplier = 1u32.checked_shl(empty_cycles.min(8)).unwrap_or(u32::MAX);
    config
        .poll_interval
        .saturating_mul(multiplier)
        .min(config.max_empty_backoff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let config = DrainerConfig {
            poll_interval: Duration::from_millis(100),
            batch_size: 10,
            max_empty_backoff: Duration::from_secs(1),
        };

        assert_eq!(next_delay(&config, 0), Duration::from_millis(100));
        assert_eq!(next_delay(&config, 1), Duration::from_millis(200));
        assert_eq!(next_delay(&config, 2), Duration::from_millis(400));
        assert_eq!(next_delay(&config, 10), Duration::from_secs(1));
    }
}
