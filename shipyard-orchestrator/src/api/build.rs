//! Build API Handlers

use axum::{
    body::Body,
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;

/// GET /builds/{id}/logs
/// Stream the CI log of a build, one line per chunk
pub async fn get_build_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    tracing::debug!("Streaming logs for build: {}", id);

    let lines = state.orchestrator.build_logs(id).await?;
    let body = Body::from_stream(lines.map(|line| line.map(|line| format!("{}\n", line))));

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response())
}
