//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::bus::BusError;
use crate::gateway::GatewayError;
use crate::repository::RepositoryError;
use crate::service::OrchestratorError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    /// An external system (CI, GitOps) failed
    Dependency(String),
    DatabaseError(RepositoryError),
    InternalError(String),
    Webhook(GatewayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Dependency(msg) => {
                tracing::warn!("Dependency error: {}", msg);
                (StatusCode::BAD_GATEWAY, msg)
            }
            ApiError::DatabaseError(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
            ApiError::Webhook(err) => (err.status_code(), err.to_string()),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            OrchestratorError::Validation(msg) => ApiError::BadRequest(msg),
            OrchestratorError::Conflict(msg) => ApiError::Conflict(msg),
            OrchestratorError::Dependency(e) => ApiError::Dependency(e.to_string()),
            OrchestratorError::Repository(e) => ApiError::DatabaseError(e),
            OrchestratorError::Bus(e) => ApiError::InternalError(e.to_string()),
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError::Webhook(err)
    }
}

impl From<BusError> for ApiError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::InvalidSubject(_) => ApiError::BadRequest(err.to_string()),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
