//! Event history API Handler

use axum::{
    Json,
    extract::{Query, State},
};
use shipyard_core::domain::event::EventRecord;
use shipyard_core::dto::workflow::EventQuery;

use crate::api::AppState;
use crate::api::error::ApiResult;

/// GET /events
/// Retained bus events matching a subject pattern and time range
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> ApiResult<Json<Vec<EventRecord>>> {
    tracing::debug!("Listing events: {:?}", query);

    let events = state.bus.history(&query).await?;
    Ok(Json(events))
}
