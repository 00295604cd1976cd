//! Active-passive failover proxy: reverse-proxies HTTP to a primary
//! and a replica campaign-service upstream, with health-monitored routing
//! and hysteresis to avoid flapping.

pub mod health;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info};

pub use health::{spawn_health_probes, HealthProbeConfig};
pub use state::{ProxyState, Upstream};

/// Shared proxy application state for axum handlers.
#[derive(Clone)]
pub struct ProxyApp {
    pub state: Arc<ProxyState>,
    pub client: Client,
}

/// Build the axum router for the proxy's HTTP surface:
/// `/health`, `/status`, and `ANY /api/<service>/*path` forwarded to the
/// active upstream.
pub fn router(app: ProxyApp) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/api/:service/*path", any(forward_handler))
        .with_state(app)
}

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    primary: UpstreamHealth,
    replica: UpstreamHealth,
}

#[derive(Serialize)]
struct UpstreamHealth {
    healthy: bool,
    consecutive_failures: u32,
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    health: HealthResponse,
    active: &'static str,
}

async fn health_handler(State(app): State<ProxyApp>) -> Json<HealthResponse> {
    Json(build_health(&app.state))
}

async fn status_handler(State(app): State<ProxyApp>) -> Json<StatusResponse> {
    let health = build_health(&app.state);
    let active = app.state.active();
    Json(StatusResponse {
        health,
        active: active.as_str(),
    })
}

fn build_health(state: &ProxyState) -> HealthResponse {
    let primary = state.snapshot(Upstream::Primary);
    let replica = state.snapshot(Upstream::Replica);
    HealthResponse {
        healthy: primary.healthy || replica.healthy,
        primary: UpstreamHealth {
            healthy: primary.healthy,
            consecutive_failures: primary.consecutive_failures,
        },
        replica: UpstreamHealth {
            healthy: replica.healthy,
            consecutive_failures: replica.consecutive_failures,
        },
    }
}

/// Headers stripped before forwarding — these are hop-by-hop or
/// content-framing headers that must be recomputed for the new
/// destination rather than carried through verbatim.
const STRIPPED_REQUEST_HEADERS: &[&str] = &["host", "content-length", "transfer-encoding", "connection"];

async fn forward_handler(
    State(app): State<ProxyApp>,
    Path((service, path)): Path<(String, String)>,
    request: Request,
) -> Response {
    let active = app.state.active();
    let base = app.state.base_url(active);
    let target = format!("{base}/{service}/{path}");
    let query = request.uri().query().map(|q| format!("?{q}")).unwrap_or_default();
    let target = format!("{target}{query}");

    let method = request.method().clone();
    let headers = request.headers().clone();
    let body_bytes = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "failed to buffer proxied request body");
            return (StatusCode::BAD_GATEWAY, "failed to read request body").into_response();
        }
    };

    let mut outbound = app
        .client
        .request(
            reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET),
            &target,
        )
        .body(body_bytes.to_vec());

    for (name, value) in headers.iter() {
        if STRIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let Ok(value_str) = value.to_str() {
            outbound = outbound.header(name.as_str(), value_str);
        }
    }

    match outbound.send().await {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut headers = HeaderMap::new();
            for (name, value) in resp.headers().iter() {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_str().as_bytes()),
                    axum::http::HeaderValue::from_bytes(value.as_bytes()),
                ) {
                    headers.insert(name, value);
                }
            }
            let body = resp.bytes().await.unwrap_or_default();
            let mut response = Response::builder().status(status);
            for (name, value) in headers.iter() {
                response = response.header(name, value);
            }
            response.body(Body::from(body)).unwrap_or_else(|_| {
                (StatusCode::BAD_GATEWAY, "failed to build proxied response").into_response()
            })
        }
        Err(e) => {
            error!(upstream = %active.as_str(), target, error = %e, "forward failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({
                    "error": "upstream unreachable",
                    "upstream": active.as_str(),
                    "detail": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}

/// Start the proxy's HTTP server on `port`. Returns once the listener is
/// bound; serving runs until the process exits.
pub async fn serve(app: ProxyApp, port: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = router(app);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let actual_port = listener.local_addr()?.port();
    info!(port = actual_port, "failover proxy listening");
    axum::serve(listener, router).await?;
    Ok(())
}

/// Default per-call deadline for proxy-forwarded requests, mirroring the
/// participant adapter default.
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use tower::ServiceExt;

    fn test_app() -> ProxyApp {
        ProxyApp {
            state: Arc::new(ProxyState::new(
                "http://127.0.0.1:1".to_string(),
                "http://127.0.0.1:2".to_string(),
                3,
            )),
            client: Client::new(),
        }
    }

    #[tokio::test]
    async fn health_reports_both_upstreams_unhealthy_before_any_probe() {
        let app = router(test_app());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["healthy"], false);
    }

    #[tokio::test]
    async fn status_reports_active_upstream() {
        let app = router(test_app());
        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["active"], "primary");
    }

    #[tokio::test]
    async fn forward_unreachable_upstream_returns_bad_gateway() {
        let app = router(test_app());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/campaigns/123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
