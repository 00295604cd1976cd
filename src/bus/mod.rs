//! Event bus client: typed publish/subscribe over a log-structured
//! broker, with per-key ordering, shared/failover subscription modes, and
//! dead-letter routing after a configurable redelivery limit.
//!
//! Only the in-process `channel` backend is implemented here — a real
//! deployment would add a Kafka/Pulsar-backed implementation of the same
//! `EventBus` trait, following this module's shape.

pub mod channel;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use channel::ChannelEventBus;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("subscribe not supported for this bus type")]
    SubscribeNotSupported,
}

/// The event envelope published to every topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub schema_version: String,
    pub event_type: String,
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl EventEnvelope {
    /// Build an envelope with schema_version "v1" and a fresh event ID.
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            schema_version: "v1".to_string(),
            event_type: event_type.into(),
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Broker message properties mirroring the envelope's identifying fields
/// (event type, affiliate/aggregate ID, schema version), carried alongside
/// the payload.
#[derive(Debug, Clone, Default)]
pub struct PublishProperties {
    pub extra: HashMap<String, String>,
}

impl PublishProperties {
    pub fn for_envelope(envelope: &EventEnvelope) -> Self {
        let mut extra = HashMap::new();
        extra.insert("event_type".to_string(), envelope.event_type.clone());
        extra.insert(
            "schema_version".to_string(),
            envelope.schema_version.clone(),
        );
        Self { extra }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Outcome a handler returns for a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Message processed; do not redeliver.
    Ack,
    /// Message not processed; redeliver after back-off, up to
    /// `max-redeliver-count`, after which it is routed to the DLQ.
    Nack,
}

/// Handler for processing events delivered by a subscription.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: Arc<EventEnvelope>) -> Ack;
}

/// Subscription mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Load-balanced across all consumers registered under the subscription.
    Shared,
    /// Single active consumer per subscription; others stand by.
    Failover,
}

/// Typed publish/subscribe over a log-structured broker.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish `envelope` to `topic`, partitioned by `key`. Blocking up to
    /// a send timeout; the broker provides per-key partitioning and durable
    /// storage.
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        envelope: EventEnvelope,
        properties: PublishProperties,
    ) -> Result<()>;

    /// Subscribe `handler` to `topic` under `subscription`, in `mode`.
    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
        mode: SubscriptionMode,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()>;
}

/// Broker topic names and DLQ naming.
pub mod topics {
    pub const SAGA_EVENTS: &str = "saga-events";
    pub const PAYMENTS_EVENTS: &str = "payments-events";

    /// `campaigns.evt.*` — campaign lifecycle events, partitioned by campaign ID.
    pub fn campaign_event(kind: &str) -> String {
        format!("campaigns.evt.{kind}")
    }

    /// `tracking.commands.Register<Kind>.v1` — one topic per tracking-event kind.
    pub fn tracking_command(kind: &str) -> String {
        format!("tracking.commands.Register{kind}.v1")
    }

    /// Auto-generated DLQ topic for a given subscription's backing topic.
    pub fn dlq_topic(topic: &str) -> String {
        format!("{topic}.DLQ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_v1_schema_and_fresh_id() {
        let a = EventEnvelope::new("SagaStarted", serde_json::json!({}));
        let b = EventEnvelope::new("SagaStarted", serde_json::json!({}));
        assert_eq!(a.schema_version, "v1");
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn dlq_topic_naming() {
        assert_eq!(topics::dlq_topic("saga-events"), "saga-events.DLQ");
    }

    #[test]
    fn tracking_topic_naming() {
        assert_eq!(
            topics::tracking_command("Click"),
            "tracking.commands.RegisterClick.v1"
        );
    }
}
