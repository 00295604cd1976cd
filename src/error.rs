//! Crate-wide HTTP-facing error type.
//!
//! Individual modules (`bus`, `saga`, `participants`) define their own
//! `thiserror` enums for internal propagation; handlers at the HTTP edge
//! convert into `AppError`, which maps each failure mode onto its HTTP
//! status code (400 validation, 404 unknown, 409 conflict, 502 upstream,
//! 503 dependency-unhealthy).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("dependency unhealthy: {0}")]
    DependencyUnhealthy(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<crate::saga::SagaError> for AppError {
    fn from(e: crate::saga::SagaError) -> Self {
        match e {
            crate::saga::SagaError::NotFound(id) => AppError::NotFound(format!("saga {id}")),
            crate::saga::SagaError::VersionConflict { .. } => AppError::Conflict(e.to_string()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<crate::saga::engine::EngineError> for AppError {
    fn from(e: crate::saga::engine::EngineError) -> Self {
        match e {
            crate::saga::engine::EngineError::Saga(saga_error) => saga_error.into(),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<crate::control::data_service_config::DataServiceConfigError> for AppError {
    fn from(e: crate::control::data_service_config::DataServiceConfigError) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Validation(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            AppError::UpstreamUnreachable(m) => (StatusCode::BAD_GATEWAY, m.clone()),
            AppError::DependencyUnhealthy(m) => (StatusCode::SERVICE_UNAVAILABLE, m.clone()),
            AppError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m.clone()),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
