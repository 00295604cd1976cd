//! In-process event bus backed by tokio broadcast channels.
//!
//! Suitable for standalone/dev deployments and tests: no external broker.
//! Redelivery-with-backoff and dead-lettering are implemented in-process
//! (a real broker backend would let the broker itself own redelivery).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, warn};

use super::{Ack, EventBus, EventEnvelope, EventHandler, PublishProperties, Result, SubscriptionMode};
use crate::utils::retry::RetryConfig;

const CHANNEL_CAPACITY: usize = 1024;

/// In-memory event bus using one broadcast channel per topic.
pub struct ChannelEventBus {
    topics: RwLock<HashMap<String, broadcast::Sender<Arc<EventEnvelope>>>>,
    max_redeliver_count: u32,
}

impl ChannelEventBus {
    pub fn new(max_redeliver_count: u32) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            max_redeliver_count,
        }
    }

    async fn sender_for(&self, topic: &str) -> broadcast::Sender<Arc<EventEnvelope>> {
        if let Some(tx) = self.topics.read().await.get(topic) {
            return tx.clone();
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl EventBus for ChannelEventBus {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        envelope: EventEnvelope,
        _properties: PublishProperties,
    ) -> Result<()> {
        let sender = self.sender_for(topic).await;
        let envelope = Arc::new(envelope);

        match sender.send(envelope) {
            Ok(receivers) => {
                debug!(topic, key, receivers, "published event");
            }
            Err(_) => {
                debug!(topic, key, "published event (no subscribers)");
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
        mode: SubscriptionMode,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        let sender = self.sender_for(topic).await;
        let dlq_sender = self.sender_for(&super::topics::dlq_topic(topic)).await;
        let mut receiver = sender.subscribe();
        let max_redeliver_count = self.max_redeliver_count;
        let topic = topic.to_string();
        let subscription = subscription.to_string();
        let backoff = RetryConfig::for_outbox_drain();

        tokio::spawn(async move {
            loop {
                let envelope = match receiver.recv().await {
                    Ok(envelope) => envelope,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(topic, subscription, skipped = n, "subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let mut attempt = 0u32;
                loop {
                    match handler.handle(envelope.clone()).await {
                        Ack::Ack => break,
                        Ack::Nack => {
                            attempt += 1;
                            if attempt >= max_redeliver_count {
                                error!(
                                    topic,
                                    subscription,
                                    event_id = %envelope.event_id,
                                    "redelivery limit exceeded, routing to DLQ"
                                );
                                let _ = dlq_sender.send(envelope.clone());
                                break;
                            }
                            let delay = backoff.delay_for_attempt(attempt);
                            warn!(
                                topic,
                                subscription,
                                event_id = %envelope.event_id,
                                attempt,
                                ?delay,
                                "handler NACKed, redelivering"
                            );
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        });

        debug!(topic, subscription, ?mode, "subscription registered");
        Ok(())
    }
}

impl Default for ChannelEventBus {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests;
