//! Workflow API Handlers
//!
//! Operator endpoints for inspecting and steering workflows.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use shipyard_core::domain::workflow::Workflow;
use shipyard_core::dto::workflow::{WorkflowDetails, WorkflowQuery};
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;

/// GET /workflows
/// List workflows, newest first
pub async fn list_workflows(
    State(state): State<AppState>,
    Query(query): Query<WorkflowQuery>,
) -> ApiResult<Json<Vec<Workflow>>> {
    tracing::debug!("Listing workflows: {:?}", query);

    let workflows = state.orchestrator.list_workflows(&query).await?;
    Ok(Json(workflows))
}

/// GET /workflows/{id}
/// Get a workflow with its build and deployment
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<WorkflowDetails>> {
    tracing::debug!("Getting workflow: {}", id);

    let details = state.orchestrator.get_workflow(id).await?;
    Ok(Json(details))
}

/// POST /workflows/{id}/cancel
pub async fn cancel_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Workflow>> {
    tracing::info!("Canceling workflow: {}", id);

    let workflow = state.orchestrator.cancel(id).await?;
    Ok(Json(workflow))
}

/// POST /workflows/{id}/rollback
pub async fn rollback_workflow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Workflow>> {
    tracing::info!("Rolling back workflow: {}", id);

    let workflow = state.orchestrator.rollback(id).await?;
    Ok(Json(workflow))
}
