//! Health Check API Handler

use axum::{Json, http::StatusCode, response::IntoResponse};

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "service": "shipyard-orchestrator",
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}
