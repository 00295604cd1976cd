use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::*;

struct CountingHandler {
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl EventHandler for CountingHandler {
    async fn handle(&self, _envelope: Arc<EventEnvelope>) -> Ack {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ack::Ack
    }
}

struct AlwaysNackHandler {
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl EventHandler for AlwaysNackHandler {
    async fn handle(&self, _envelope: Arc<EventEnvelope>) -> Ack {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Ack::Nack
    }
}

fn envelope() -> EventEnvelope {
    EventEnvelope::new("SagaStarted", serde_json::json!({"saga_id": "abc"}))
}

#[tokio::test]
async fn publish_with_no_subscribers_succeeds() {
    let bus = ChannelEventBus::default();
    let result = bus
        .publish("saga-events", "saga-1", envelope(), PublishProperties::default())
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn subscriber_receives_published_event() {
    let bus = ChannelEventBus::default();
    let count = Arc::new(AtomicUsize::new(0));

    bus.subscribe(
        "saga-events",
        "saga-worker",
        SubscriptionMode::Shared,
        Arc::new(CountingHandler {
            count: count.clone(),
        }),
    )
    .await
    .unwrap();

    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

    bus.publish("saga-events", "saga-1", envelope(), PublishProperties::default())
        .await
        .unwrap();

    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn nack_redelivers_until_redeliver_limit_then_dlq() {
    let bus = ChannelEventBus::new(3);
    let attempts = Arc::new(AtomicUsize::new(0));
    let dlq_count = Arc::new(AtomicUsize::new(0));

    bus.subscribe(
        "saga-events",
        "saga-worker",
        SubscriptionMode::Shared,
        Arc::new(AlwaysNackHandler {
            attempts: attempts.clone(),
        }),
    )
    .await
    .unwrap();

    bus.subscribe(
        &crate::bus::topics::dlq_topic("saga-events"),
        "dlq-watcher",
        SubscriptionMode::Shared,
        Arc::new(CountingHandler {
            count: dlq_count.clone(),
        }),
    )
    .await
    .unwrap();

    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

    bus.publish("saga-events", "saga-1", envelope(), PublishProperties::default())
        .await
        .unwrap();

    tokio::time::sleep(tokio::time::Duration::from_millis(200)).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(dlq_count.load(Ordering::SeqCst), 1);
}
