//! Webhook ingress
//!
//! Thin HTTP wrapper around the [`WebhookGateway`](crate::gateway::WebhookGateway):
//! the raw body is passed through untouched so signatures can be checked
//! against the exact bytes the provider signed.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
};

use crate::api::AppState;
use crate::api::error::ApiResult;

/// POST /webhooks/{provider}
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    tracing::debug!("Webhook delivery for {} ({} bytes)", provider, body.len());

    let outcome = state.gateway.handle(&provider, &headers, &body).await?;
    Ok((outcome.status_code(), Json(outcome)).into_response())
}
