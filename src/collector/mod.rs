//! Event collector: tracking-event ingress — validation, deduplication,
//! per-affiliate rate limiting, and publish to the event bus.
//!
//! The affiliate/campaign directories this pipeline validates against are
//! external domain collaborators and out of scope for this crate; they are
//! modeled here as capability traits ([`AffiliateDirectory`],
//! [`CampaignDirectory`]) the caller supplies, keeping storage concerns
//! behind a trait boundary rather than wiring a concrete directory client
//! into the validation pipeline.

pub mod http;
pub mod store;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub use store::{DedupStore, InMemoryCollectorStore, RateLimitStore};
#[cfg(feature = "redis")]
pub use store::RedisCollectorStore;

/// Tracking-event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackingEventKind {
    Click,
    Impression,
    Conversion,
    PageView,
}

impl TrackingEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingEventKind::Click => "CLICK",
            TrackingEventKind::Impression => "IMPRESSION",
            TrackingEventKind::Conversion => "CONVERSION",
            TrackingEventKind::PageView => "PAGE_VIEW",
        }
    }

    /// Camel-cased for the per-kind topic name:
    /// `tracking.commands.Register<Kind>.v1`.
    pub fn topic_suffix(&self) -> &'static str {
        match self {
            TrackingEventKind::Click => "Click",
            TrackingEventKind::Impression => "Impression",
            TrackingEventKind::Conversion => "Conversion",
            TrackingEventKind::PageView => "PageView",
        }
    }
}

/// Inbound tracking-event request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackingEventRequest {
    pub kind: TrackingEventKind,
    pub affiliate: String,
    pub campaign: Option<String>,
    pub offer: Option<String>,
    pub url: Option<String>,
    pub timestamp: chrono::DateTime<Utc>,
    #[serde(default)]
    pub custom_data: Value,
    pub value: Option<f64>,
    pub currency: Option<String>,
}

/// Terminal/intermediate state of a collected event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventState {
    Published,
    Discarded { rule: String },
    Failed { reason: String, retriable: bool },
}

/// A collected event plus its current disposition, as exposed by the
/// status/retry endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectedEvent {
    pub id: Uuid,
    pub kind: TrackingEventKind,
    pub affiliate: String,
    pub campaign: Option<String>,
    pub fingerprint: String,
    pub state: EventState,
}

/// Computes the fingerprint hash: SHA-256 over `{kind, affiliate, campaign,
/// offer, url, timestamp, custom_data}` with keys sorted into a canonical
/// form, so the same event always hashes the same regardless of field
/// order.
pub fn fingerprint(req: &TrackingEventRequest) -> String {
    let canonical = serde_json::json!({
        "campaign": req.campaign,
        "custom_data": req.custom_data,
        "kind": req.kind.as_str(),
        "affiliate": req.affiliate,
        "offer": req.offer,
        "timestamp": req.timestamp.to_rfc3339(),
        "url": req.url,
    });
    // serde_json's default Map is a BTreeMap, so keys serialize sorted
    // without the `preserve_order` feature.
    let canonical_str = serde_json::to_string(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical_str.as_bytes());
    hex::encode(hasher.finalize())
}

/// Capability for checking affiliate existence/status/permissions — the
/// affiliate entity itself is out of scope.
#[async_trait::async_trait]
pub trait AffiliateDirectory: Send + Sync {
    async fn is_active(&self, affiliate: &str) -> bool;
    async fn has_permission(&self, affiliate: &str, kind: TrackingEventKind) -> bool;
    async fn rate_limit_cap_per_minute(&self, affiliate: &str) -> u32;
}

/// Capability for checking campaign existence/status — out of scope as a
/// domain entity.
#[async_trait::async_trait]
pub trait CampaignDirectory: Send + Sync {
    async fn is_active(&self, campaign: &str) -> bool;
}

/// Default directory pairing for standalone deployments that have no
/// affiliate/campaign service to consult: every affiliate and campaign is
/// treated as active and permitted, capped at a flat per-minute rate.
/// Swap in a real directory (backed by whatever service owns that data)
/// once one exists.
pub struct PermissiveDirectory {
    pub rate_limit_cap_per_minute: u32,
}

impl Default for PermissiveDirectory {
    fn default() -> Self {
        Self {
            rate_limit_cap_per_minute: 100,
        }
    }
}

#[async_trait::async_trait]
impl AffiliateDirectory for PermissiveDirectory {
    async fn is_active(&self, _affiliate: &str) -> bool {
        true
    }
    async fn has_permission(&self, _affiliate: &str, _kind: TrackingEventKind) -> bool {
        true
    }
    async fn rate_limit_cap_per_minute(&self, _affiliate: &str) -> u32 {
        self.rate_limit_cap_per_minute
    }
}

#[async_trait::async_trait]
impl CampaignDirectory for PermissiveDirectory {
    async fn is_active(&self, _campaign: &str) -> bool {
        true
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("affiliate not found or inactive")]
    AffiliateInactive,
    #[error("affiliate lacks permission for event kind")]
    PermissionDenied,
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error("campaign not found or inactive")]
    CampaignInactive,
    #[error("duplicate event")]
    DuplicateFingerprint,
    #[error("conversion requires a positive value and currency")]
    InvalidConversionPayload,
}

impl PartialEq for ValidationError {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Runs the ordered validation pipeline, short-
/// circuiting on first failure.
pub async fn validate(
    req: &TrackingEventRequest,
    fingerprint: &str,
    affiliates: &dyn AffiliateDirectory,
    campaigns: &dyn CampaignDirectory,
    dedup: &dyn DedupStore,
    rate_limit: &dyn RateLimitStore,
    window_secs: u64,
) -> Result<(), ValidationError> {
    if !affiliates.is_active(&req.affiliate).await {
        return Err(ValidationError::AffiliateInactive);
    }
    if !affiliates.has_permission(&req.affiliate, req.kind).await {
        return Err(ValidationError::PermissionDenied);
    }
    let cap = affiliates.rate_limit_cap_per_minute(&req.affiliate).await;
    let current = rate_limit.current_count(&req.affiliate, window_secs).await;
    if current >= cap as u64 {
        return Err(ValidationError::RateLimitExceeded);
    }
    if let Some(campaign) = &req.campaign {
        if !campaigns.is_active(campaign).await {
            return Err(ValidationError::CampaignInactive);
        }
    }
    if dedup.contains(fingerprint).await {
        return Err(ValidationError::DuplicateFingerprint);
    }
    if matches!(req.kind, TrackingEventKind::Conversion) {
        let valid_value = req.value.is_some_and(|v| v > 0.0);
        let valid_currency = req.currency.as_ref().is_some_and(|c| !c.is_empty());
        if !valid_value || !valid_currency {
            return Err(ValidationError::InvalidConversionPayload);
        }
    }
    Ok(())
}

/// Partition key for the tracking topic: `affiliate#campaign` if a campaign
/// is named, else just `affiliate`.
pub fn partition_key(req: &TrackingEventRequest) -> String {
    match &req.campaign {
        Some(campaign) => format!("{}#{}", req.affiliate, campaign),
        None => req.affiliate.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request(kind: TrackingEventKind) -> TrackingEventRequest {
        TrackingEventRequest {
            kind,
            affiliate: "A1".to_string(),
            campaign: Some("C1".to_string()),
            offer: None,
            url: Some("https://example.com".to_string()),
            timestamp: Utc::now(),
            custom_data: serde_json::json!({}),
            value: None,
            currency: None,
        }
    }

    #[test]
    fn fingerprint_is_deterministic_for_same_input() {
        let req = sample_request(TrackingEventKind::Click);
        assert_eq!(fingerprint(&req), fingerprint(&req));
    }

    #[test]
    fn fingerprint_differs_on_kind() {
        let a = fingerprint(&sample_request(TrackingEventKind::Click));
        let b = fingerprint(&sample_request(TrackingEventKind::Impression));
        assert_ne!(a, b);
    }

    #[test]
    fn partition_key_includes_campaign_when_present() {
        let req = sample_request(TrackingEventKind::Click);
        assert_eq!(partition_key(&req), "A1#C1");
    }

    #[test]
    fn partition_key_falls_back_to_affiliate_only() {
        let mut req = sample_request(TrackingEventKind::Click);
        req.campaign = None;
        assert_eq!(partition_key(&req), "A1");
    }

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

    #[tokio::test]
    async fn conversion_without_value_is_rejected() {
        let req = sample_request(TrackingEventKind::Conversion);
        let dedup = InMemoryCollectorStore::default();
        let result = validate(&req, "fp-1", &AlwaysOk, &AlwaysOk, &dedup, &dedup, 60).await;
        assert_eq!(result, Err(ValidationError::InvalidConversionPayload));
    }

    #[tokio::test]
    async fn click_without_value_passes() {
        let req = sample_request(TrackingEventKind::Click);
        let dedup = InMemoryCollectorStore::default();
        let result = validate(&req, "fp-2", &AlwaysOk, &AlwaysOk, &dedup, &dedup, 60).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn duplicate_fingerprint_short_circuits() {
        let req = sample_request(TrackingEventKind::Click);
        let dedup = InMemoryCollectorStore::default();
        dedup.insert("fp-3", 60).await;
        let result = validate(&req, "fp-3", &AlwaysOk, &AlwaysOk, &dedup, &dedup, 60).await;
        assert_eq!(result, Err(ValidationError::DuplicateFingerprint));
    }
}
