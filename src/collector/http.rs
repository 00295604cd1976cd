//! HTTP surface for the event collector:
//! `POST /event-collector/events`, `POST /event-collector/events/{id}/retry`,
//! `GET /event-collector/events/{id}/status`,
//! `GET /event-collector/rate-limit/{affiliate}?ventana_minutos=N`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::bus::{EventBus, EventEnvelope, PublishProperties};
use crate::error::AppError;

use super::store::{DedupStore, RateLimitStore};
use super::{
    fingerprint, partition_key, validate, AffiliateDirectory, CampaignDirectory, CollectedEvent, EventState,
    TrackingEventRequest, ValidationError,
};

/// In-process log of collected events, keyed by the ID this service
/// assigns on ingress — backs the status/retry endpoints. A production
/// deployment would persist this in the same store as the outbox; kept
/// in-memory here since it is purely an operational surface, not a
/// durability requirement.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<HashMap<Uuid, (CollectedEvent, TrackingEventRequest)>>,
}

impl EventLog {
    fn insert(&self, event: CollectedEvent, request: TrackingEventRequest) {
        self.events.lock().expect("event log lock poisoned").insert(event.id, (event, request));
    }

    fn get(&self, id: Uuid) -> Option<CollectedEvent> {
        self.events.lock().expect("event log lock poisoned").get(&id).map(|(e, _)| e.clone())
    }

    fn set_state(&self, id: Uuid, state: EventState) {
        if let Some((event, _)) = self.events.lock().expect("event log lock poisoned").get_mut(&id) {
            event.state = state;
        }
    }
}

#[derive(Clone)]
pub struct CollectorApp {
    pub bus: Arc<dyn EventBus>,
    pub affiliates: Arc<dyn AffiliateDirectory>,
    pub campaigns: Arc<dyn CampaignDirectory>,
    pub dedup: Arc<dyn DedupStore>,
    pub rate_limit: Arc<dyn RateLimitStore>,
    pub rate_limit_window_secs: u64,
    pub log: Arc<EventLog>,
}

pub fn router(app: CollectorApp) -> Router {
    Router::new()
        .route("/event-collector/events", post(submit))
        .route("/event-collector/events/:id/retry", post(retry))
        .route("/event-collector/events/:id/status", get(status))
        .route("/event-collector/rate-limit/:affiliate", get(rate_limit))
        .with_state(app)
}

async fn run_pipeline(app: &CollectorApp, req: TrackingEventRequest) -> CollectedEvent {
    let id = Uuid::new_v4();
    let fp = fingerprint(&req);

    let validation = validate(
        &req,
        &fp,
        app.affiliates.as_ref(),
        app.campaigns.as_ref(),
        app.dedup.as_ref(),
        app.rate_limit.as_ref(),
        app.rate_limit_window_secs,
    )
    .await;

    let state = match validation {
        Err(ValidationError::DuplicateFingerprint) => EventState::Discarded {
            rule: "duplicate fingerprint".to_string(),
        },
        Err(e) => EventState::Discarded { rule: e.to_string() },
        Ok(()) => {
            app.rate_limit.increment(&req.affiliate, app.rate_limit_window_secs).await;
            // TTL matches the rate-limit window: a fingerprint only needs
            // to be rejected for as long as its originating window is live.
            app.dedup.insert(&fp, app.rate_limit_window_secs).await;

            let topic = format!("tracking.commands.Register{}.v1", req.kind.topic_suffix());
            let key = partition_key(&req);
            let envelope = EventEnvelope::new(
                format!("Register{}", req.kind.topic_suffix()),
                json!({
                    "event_id": id,
                    "affiliate": req.affiliate,
                    "campaign": req.campaign,
                    "offer": req.offer,
                    "url": req.url,
                    "timestamp": req.timestamp,
                    "custom_data": req.custom_data,
                    "value": req.value,
                    "currency": req.currency,
                    "fingerprint": fp,
                }),
            );
            let properties = PublishProperties::for_envelope(&envelope)
                .with("affiliate", req.affiliate.clone())
                .with("kind", req.kind.as_str());

            match app.bus.publish(&topic, &key, envelope, properties).await {
                Ok(()) => EventState::Published,
                Err(e) => EventState::Failed {
                    reason: e.to_string(),
                    retriable: true,
                },
            }
        }
    };

    CollectedEvent {
        id,
        kind: req.kind,
        affiliate: req.affiliate.clone(),
        campaign: req.campaign.clone(),
        fingerprint: fp,
        state,
    }
}

async fn submit(
    State(app): State<CollectorApp>,
    Json(req): Json<TrackingEventRequest>,
) -> Result<Json<CollectedEvent>, AppError> {
    let request = req.clone();
    let event = run_pipeline(&app, req).await;
    app.log.insert(event.clone(), request);
    Ok(Json(event))
}

async fn status(
    State(app): State<CollectorApp>,
    Path(id): Path<Uuid>,
) -> Result<Json<CollectedEvent>, AppError> {
    app.log
        .get(id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("event {id}")))
}

/// Retry a previously `FAILED` event via an admin endpoint. Re-runs the
/// pipeline against the originally submitted request and updates the
/// logged state.
async fn retry(State(app): State<CollectorApp>, Path(id): Path<Uuid>) -> Result<Json<CollectedEvent>, AppError> {
    let original = {
        let events = app.log.events.lock().expect("event log lock poisoned");
        events.get(&id).cloned()
    };
    let Some((existing, original_request)) = original else {
        return Err(AppError::NotFound(format!("event {id}")));
    };

    if !matches!(existing.state, EventState::Failed { retriable: true, .. }) {
        return Err(AppError::Conflict(format!("event {id} is not retriable")));
    }

    let retried = run_pipeline(&app, original_request).await;
    app.log.set_state(id, retried.state.clone());
    Ok(Json(CollectedEvent {
        id,
        ..retried
    }))
}

#[derive(Debug, Deserialize)]
struct RateLimitQuery {
    #[serde(default = "default_window_minutes")]
    ventana_minutos: u64,
}

fn default_window_minutes() -> u64 {
    1
}

#[derive(serde::Serialize, serde::Deserialize)]
struct RateLimitResponse {
    affiliate: String,
    window_minutes: u64,
    count: u64,
}

async fn rate_limit(
    State(app): State<CollectorApp>,
    Path(affiliate): Path<String>,
    Query(query): Query<RateLimitQuery>,
) -> Json<RateLimitResponse> {
    let window_secs = query.ventana_minutos * 60;
    let count = app.rate_limit.current_count(&affiliate, window_secs).await;
    Json(RateLimitResponse {
        affiliate,
        window_minutes: query.ventana_minutos,
        count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChannelEventBus;
    use crate::collector::{InMemoryCollectorStore, TrackingEventKind};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use tower::ServiceExt;

    struct AlwaysOk;
    #[async_trait::async_trait]
    impl AffiliateDirectory for AlwaysOk {
        async fn is_active(&self, _affiliate: &str) -> bool {
            true
        }
        async fn has_permission(&self, _affiliate: &str, _kind: TrackingEventKind) -> bool {
            true
        }
        async fn rate_limit_cap_per_minute(&self, _affiliate: &str) -> u32 {
            100
        }
    }
    #[async_trait::async_trait]
    impl CampaignDirectory for AlwaysOk {
        async fn is_active(&self, _campaign: &str) -> bool {
            true
        }
    }

    fn test_app() -> CollectorApp {
        let store = Arc::new(InMemoryCollectorStore::default());
        CollectorApp {
            bus: Arc::new(ChannelEventBus::default()),
            affiliates: Arc::new(AlwaysOk),
            campaigns: Arc::new(AlwaysOk),
            dedup: store.clone(),
            rate_limit: store,
            rate_limit_window_secs: 60,
            log: Arc::new(EventLog::default()),
        }
    }

    fn sample_body() -> serde_json::Value {
        json!({
            "kind": "CLICK",
            "affiliate": "A1",
            "campaign": "C1",
            "offer": null,
            "url": "https://example.com",
            "timestamp": Utc::now().to_rfc3339(),
            "custom_data": {},
        })
    }

    #[tokio::test]
    async fn submit_publishes_and_returns_event() {
        let app = router(test_app());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/event-collector/events")
                    .header("content-type", "application/json")
                    .body(Body::from(sample_body().to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let event: CollectedEvent = serde_json::from_slice(&body).unwrap();
        assert_eq!(event.state, EventState::Published);
    }

    #[tokio::test]
    async fn duplicate_submission_is_discarded() {
        let collector_app = test_app();
        let app = router(collector_app.clone());

        let first = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/event-collector/events")
                    .header("content-type", "application/json")
                    .body(Body::from(sample_body().to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/event-collector/events")
                    .header("content-type", "application/json")
                    .body(Body::from(sample_body().to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = to_bytes(second.into_body(), usize::MAX).await.unwrap();
        let event: CollectedEvent = serde_json::from_slice(&body).unwrap();
        assert!(matches!(event.state, EventState::Discarded { .. }));
    }

    #[tokio::test]
    async fn status_endpoint_returns_logged_event() {
        let collector_app = test_app();
        let event = run_pipeline(&collector_app, TrackingEventRequest {
            kind: TrackingEventKind::Click,
            affiliate: "A1".to_string(),
            campaign: None,
            offer: None,
            url: None,
            timestamp: Utc::now(),
            custom_data: json!({}),
            value: None,
            currency: None,
        })
        .await;
        collector_app.log.insert(
            event.clone(),
            TrackingEventRequest {
                kind: TrackingEventKind::Click,
                affiliate: "A1".to_string(),
                campaign: None,
                offer: None,
                url: None,
                timestamp: Utc::now(),
                custom_data: json!({}),
                value: None,
                currency: None,
            },
        );

        let app = router(collector_app);
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/event-collector/events/{}/status", event.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rate_limit_endpoint_reports_zero_for_unknown_affiliate() {
        let app = router(test_app());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/event-collector/rate-limit/A9?ventana_minutos=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: RateLimitResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.count, 0);
    }
}
