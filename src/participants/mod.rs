//! Participant adapters: pluggable invokers that call out to the
//! campaign/payment/report services and translate their responses into
//! step results.
//!
//! Every adapter implements [`ParticipantAdapter`]. All but the payment
//! adapter complete synchronously; [`PaymentAdapter::invoke`] returns
//! [`AdapterOutcome::Pending`] and the actual success/failure arrives later
//! as a `PaymentCompleted`/`PaymentFailed` event — the single exception to
//! synchronous step completion.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::control::data_service_config::DataServiceConfigStore;
use crate::saga::model::{CompensationKind, StepKind};
use crate::utils::retry::is_retryable_status;

pub type Result<T> = std::result::Result<T, AdapterError>;

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timeout calling {0}")]
    Timeout(String),
}

/// Outcome of invoking a participant.
#[derive(Debug, Clone)]
pub enum AdapterOutcome {
    /// Synchronous success; carries the participant's response body.
    Ok(Value),
    /// Payment accepted but not yet settled — the saga enters a waiting
    /// sub-state until a later `PaymentCompleted`/`PaymentFailed` event
    /// resolves it. Carries the payment ID the engine correlates on.
    Pending { payment_id: String },
    /// Business rejection (4xx) — never retried, triggers step failure /
    /// compensation.
    Err { reason: String, retriable: bool },
}

/// A forward-step or compensation invoker.
#[async_trait]
pub trait ParticipantAdapter: Send + Sync {
    async fn invoke(&self, input: &Value) -> AdapterOutcome;
}

/// Classifies an HTTP response into the adapter outcome shared by all
/// synchronous adapters: 2xx is `Ok`, 4xx is a non-retriable `Err`, and
/// 5xx or a transport timeout is a retriable `Err`.
async fn classify_response(resp: std::result::Result<reqwest::Response, reqwest::Error>) -> AdapterOutcome {
    match resp {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                let body = resp.json::<Value>().await.unwrap_or(Value::Null);
                AdapterOutcome::Ok(body)
            } else {
                let retriable = is_retryable_status(status.as_u16());
                let body = resp.text().await.unwrap_or_default();
                AdapterOutcome::Err {
                    reason: format!("status {status}: {body}"),
                    retriable,
                }
            }
        }
        Err(e) if e.is_timeout() => AdapterOutcome::Err {
            reason: format!("timeout: {e}"),
            retriable: true,
        },
        Err(e) => AdapterOutcome::Err {
            reason: format!("transport error: {e}"),
            retriable: true,
        },
    }
}

/// `CREATE_CAMPAIGN`: POSTs to the campaigns endpoint, via the failover
/// proxy.
pub struct CreateCampaignAdapter {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl CreateCampaignAdapter {
    pub fn new(client: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ParticipantAdapter for CreateCampaignAdapter {
    async fn invoke(&self, input: &Value) -> AdapterOutcome {
        let url = format!("{}/api/campaigns", self.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(input)
            .send()
            .await;
        classify_response(resp).await
    }
}

/// `CANCEL_CAMPAIGN`: PATCHes `/cancel` on the campaign created in the
/// forward step. `input` is the successful `CREATE_CAMPAIGN` step's result.
pub struct CancelCampaignAdapter {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl CancelCampaignAdapter {
    pub fn new(client: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ParticipantAdapter for CancelCampaignAdapter {
    async fn invoke(&self, input: &Value) -> AdapterOutcome {
        let Some(id) = input.get("id").and_then(Value::as_str) else {
            return AdapterOutcome::Err {
                reason: "campaign result missing id".to_string(),
                retriable: false,
            };
        };
        let url = format!("{}/api/campaigns/{id}/cancel", self.base_url);
        let resp = self.client.patch(&url).timeout(self.timeout).send().await;
        classify_response(resp).await
    }
}

/// `PROCESS_PAYMENT`: POSTs to the payments endpoint. The payment service
/// responds immediately with `PENDING`; actual settlement arrives later via
/// `PaymentCompleted`/`PaymentFailed` — the asynchronous path chosen as
/// canonical over a synchronous settlement call (see DESIGN.md).
pub struct ProcessPaymentAdapter {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl ProcessPaymentAdapter {
    pub fn new(client: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ParticipantAdapter for ProcessPaymentAdapter {
    async fn invoke(&self, input: &Value) -> AdapterOutcome {
        let url = format!("{}/api/payments", self.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(input)
            .send()
            .await;

        match resp {
            Ok(resp) if resp.status() == StatusCode::CREATED || resp.status() == StatusCode::ACCEPTED => {
                match resp.json::<Value>().await {
                    Ok(body) => match body.get("id").or_else(|| body.get("payment_id")).and_then(Value::as_str) {
                        Some(id) => AdapterOutcome::Pending {
                            payment_id: id.to_string(),
                        },
                        None => AdapterOutcome::Err {
                            reason: "payment acceptance missing id".to_string(),
                            retriable: false,
                        },
                    },
                    Err(e) => AdapterOutcome::Err {
                        reason: format!("invalid payment response body: {e}"),
                        retriable: false,
                    },
                }
            }
            other => classify_response(other).await,
        }
    }
}

/// `REFUND_PAYMENT`: PATCHes `/reverse`. `input` is the payment step's
/// result, carrying the payment ID the forward step returned.
pub struct RefundPaymentAdapter {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl RefundPaymentAdapter {
    pub fn new(client: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ParticipantAdapter for RefundPaymentAdapter {
    async fn invoke(&self, input: &Value) -> AdapterOutcome {
        let id = input
            .get("id")
            .or_else(|| input.get("payment_id"))
            .and_then(Value::as_str);
        let Some(id) = id else {
            return AdapterOutcome::Err {
                reason: "payment result missing id".to_string(),
                retriable: false,
            };
        };
        let url = format!("{}/api/payments/{id}/reverse", self.base_url);
        let resp = self.client.patch(&url).timeout(self.timeout).send().await;
        classify_response(resp).await
    }
}

/// Outcome of polling the payment service directly for a payment's current
/// status — backs the manual `sync-pago` admin endpoint, for operators
/// reconciling a saga stuck waiting on a payment whose completion event
/// never arrived.
#[derive(Debug, Clone)]
pub enum PaymentLookupOutcome {
    Completed(Value),
    Failed(String),
    StillPending,
    Err(String),
}

#[async_trait]
pub trait PaymentStatusLookup: Send + Sync {
    async fn lookup(&self, payment_id: &str) -> PaymentLookupOutcome;
}

/// GETs `/api/payments/{id}` and classifies the response's `status` field.
pub struct PaymentStatusAdapter {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl PaymentStatusAdapter {
    pub fn new(client: Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl PaymentStatusLookup for PaymentStatusAdapter {
    async fn lookup(&self, payment_id: &str) -> PaymentLookupOutcome {
        let url = format!("{}/api/payments/{payment_id}", self.base_url);
        let resp = self.client.get(&url).timeout(self.timeout).send().await;

        let resp = match resp {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => return PaymentLookupOutcome::Err(format!("status {}", resp.status())),
            Err(e) => return PaymentLookupOutcome::Err(e.to_string()),
        };

        let body = match resp.json::<Value>().await {
            Ok(body) => body,
            Err(e) => return PaymentLookupOutcome::Err(format!("invalid payment body: {e}")),
        };

        match body.get("status").and_then(Value::as_str) {
            Some("completed") | Some("succeeded") => PaymentLookupOutcome::Completed(body),
            Some("failed") | Some("rejected") => {
                let reason = body
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("payment failed")
                    .to_string();
                PaymentLookupOutcome::Failed(reason)
            }
            Some("pending") | Some("processing") => PaymentLookupOutcome::StillPending,
            other => PaymentLookupOutcome::Err(format!("unrecognized payment status: {other:?}")),
        }
    }
}

/// `GENERATE_REPORT`: synchronous POST against whatever URL is currently
/// active in the data-service configuration store — resolved fresh on
/// every invocation, so a config switch takes effect on the next saga step
/// without restarting the worker. Falls back to `fallback_url` if no
/// configuration has ever been activated.
pub struct GenerateReportAdapter {
    client: Client,
    data_service_config: std::sync::Arc<dyn DataServiceConfigStore>,
    fallback_url: String,
    timeout: Duration,
}

impl GenerateReportAdapter {
    pub fn new(
        client: Client,
        data_service_config: std::sync::Arc<dyn DataServiceConfigStore>,
        fallback_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            data_service_config,
            fallback_url: fallback_url.into(),
            timeout,
        }
    }

    async fn active_url(&self) -> String {
        match self.data_service_config.get_active().await {
            Ok(Some(config)) => config.url,
            _ => self.fallback_url.clone(),
        }
    }
}

#[async_trait]
impl ParticipantAdapter for GenerateReportAdapter {
    async fn invoke(&self, input: &Value) -> AdapterOutcome {
        let base_url = self.active_url().await;
        let url = format!("{base_url}/api/reports");
        let resp = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(input)
            .send()
            .await;
        classify_response(resp).await
    }
}

/// `CANCEL_REPORT`: a no-op that always succeeds — reports carry no
/// external state to undo.
pub struct CancelReportAdapter;

#[async_trait]
impl ParticipantAdapter for CancelReportAdapter {
    async fn invoke(&self, _input: &Value) -> AdapterOutcome {
        AdapterOutcome::Ok(serde_json::json!({ "cancelled": true }))
    }
}

/// Builds the fixed set of forward-step adapters used by the
/// `CreateCompleteCampaign` topology, bound to the service base URLs
/// resolved at construction time.
pub struct AdapterRegistry {
    campaign: Box<dyn ParticipantAdapter>,
    payment: Box<dyn ParticipantAdapter>,
    report: Box<dyn ParticipantAdapter>,
    cancel_campaign: Box<dyn ParticipantAdapter>,
    refund_payment: Box<dyn ParticipantAdapter>,
    cancel_report: Box<dyn ParticipantAdapter>,
}

impl AdapterRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Client,
        campaign_service_url: impl Into<String>,
        payment_service_url: impl Into<String>,
        report_service_url: impl Into<String>,
        data_service_config: std::sync::Arc<dyn DataServiceConfigStore>,
        timeout: Duration,
    ) -> Self {
        let campaign_service_url = campaign_service_url.into();
        let payment_service_url = payment_service_url.into();
        let report_service_url = report_service_url.into();

        Self {
            campaign: Box::new(CreateCampaignAdapter::new(client.clone(), campaign_service_url.clone(), timeout)),
            payment: Box::new(ProcessPaymentAdapter::new(client.clone(), payment_service_url.clone(), timeout)),
            report: Box::new(GenerateReportAdapter::new(
                client.clone(),
                data_service_config,
                report_service_url,
                timeout,
            )),
            cancel_campaign: Box::new(CancelCampaignAdapter::new(client.clone(), campaign_service_url, timeout)),
            refund_payment: Box::new(RefundPaymentAdapter::new(client, payment_service_url, timeout)),
            cancel_report: Box::new(CancelReportAdapter),
        }
    }

    /// Build a registry from already-constructed adapters — used by tests
    /// and anywhere else that wants non-HTTP adapters (e.g. stubs) wired
    /// into the same dispatch surface the engine uses.
    pub fn from_adapters(
        campaign: Box<dyn ParticipantAdapter>,
        payment: Box<dyn ParticipantAdapter>,
        report: Box<dyn ParticipantAdapter>,
        cancel_campaign: Box<dyn ParticipantAdapter>,
        refund_payment: Box<dyn ParticipantAdapter>,
        cancel_report: Box<dyn ParticipantAdapter>,
    ) -> Self {
        Self {
            campaign,
            payment,
            report,
            cancel_campaign,
            refund_payment,
            cancel_report,
        }
    }

    pub fn forward(&self, kind: StepKind) -> &dyn ParticipantAdapter {
        match kind {
            StepKind::CreateCampaign => self.campaign.as_ref(),
            StepKind::ProcessPayment => self.payment.as_ref(),
            StepKind::GenerateReport => self.report.as_ref(),
        }
    }

    pub fn compensation(&self, kind: CompensationKind) -> &dyn ParticipantAdapter {
        match kind {
            CompensationKind::CancelCampaign => self.cancel_campaign.as_ref(),
            CompensationKind::RefundPayment => self.refund_payment.as_ref(),
            CompensationKind::CancelReport => self.cancel_report.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_report_always_succeeds() {
        let outcome = CancelReportAdapter.invoke(&serde_json::json!({})).await;
        assert!(matches!(outcome, AdapterOutcome::Ok(_)));
    }

    #[tokio::test]
    async fn generate_report_falls_back_when_no_config_active() {
        let data_service_config = std::sync::Arc::new(
            crate::control::data_service_config::InMemoryDataServiceConfigStore::new(),
        );
        let adapter = GenerateReportAdapter::new(
            Client::new(),
            data_service_config,
            "http://localhost:0",
            Duration::from_millis(1),
        );
        // Unreachable host — we're only asserting this doesn't panic and
        // falls through to a retriable transport error, proving the URL
        // resolution path ran.
        let outcome = adapter.invoke(&serde_json::json!({})).await;
        assert!(matches!(outcome, AdapterOutcome::Err { retriable: true, .. }));
    }

    #[tokio::test]
    async fn refund_payment_rejects_missing_id() {
        let adapter = RefundPaymentAdapter::new(
            Client::new(),
            "http://localhost:0",
            Duration::from_millis(1),
        );
        let outcome = adapter.invoke(&serde_json::json!({})).await;
        assert!(matches!(
            outcome,
            AdapterOutcome::Err { retriable: false, .. }
        ));
    }

    #[tokio::test]
    async fn cancel_campaign_rejects_missing_id() {
        let adapter = CancelCampaignAdapter::new(
            Client::new(),
            "http://localhost:0",
            Duration::from_millis(1),
        );
        let outcome = adapter.invoke(&serde_json::json!({})).await;
        assert!(matches!(
            outcome,
            AdapterOutcome::Err { retriable: false, .. }
        ));
    }

    #[test]
    fn adapter_registry_dispatches_by_kind() {
        let data_service_config = std::sync::Arc::new(
            crate::control::data_service_config::InMemoryDataServiceConfigStore::new(),
        );
        let registry = AdapterRegistry::new(
            Client::new(),
            "http://localhost:1",
            "http://localhost:2",
            "http://localhost:3",
            data_service_config,
            Duration::from_secs(1),
        );
        // Dispatch compiles and resolves without panicking for every kind.
        let _ = registry.forward(StepKind::CreateCampaign);
        let _ = registry.forward(StepKind::ProcessPayment);
        let _ = registry.forward(StepKind::GenerateReport);
        let _ = registry.compensation(CompensationKind::CancelCampaign);
        let _ = registry.compensation(CompensationKind::RefundPayment);
        let _ = registry.compensation(CompensationKind::CancelReport);
    }
}
