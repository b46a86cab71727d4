//! Service API Handlers

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use shipyard_core::dto::workflow::{TriggerOutcome, TriggerService};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;

/// POST /services/{id}/trigger
/// Build and deploy a service at a commit.
///
/// Answers 201 for a new workflow and 200 when the trigger was coalesced into
/// an active one.
pub async fn trigger_service(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<TriggerService>,
) -> ApiResult<(StatusCode, Json<TriggerOutcome>)> {
    tracing::info!("Manual trigger of service {} at {}", id, req.commit_sha);

    let outcome = state.orchestrator.trigger(id, req).await?;
    let status = if outcome.coalesced {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)))
}
