//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod build;
pub mod error;
pub mod event;
pub mod health;
pub mod service;
pub mod webhook;
pub mod workflow;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::bus::EventBus;
use crate::gateway::WebhookGateway;
use crate::service::Orchestrator;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub gateway: Arc<WebhookGateway>,
    pub bus: Arc<dyn EventBus>,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Provider webhooks
        .route("/webhooks/{provider}", post(webhook::receive_webhook))
        // Workflow endpoints
        .route("/workflows", get(workflow::list_workflows))
        .route("/workflows/{id}", get(workflow::get_workflow))
        .route("/workflows/{id}/cancel", post(workflow::cancel_workflow))
        .route("/workflows/{id}/rollback", post(workflow::rollback_workflow))
        // Service and build endpoints
        .route("/services/{id}/trigger", post(service::trigger_service))
        .route("/builds/{id}/logs", get(build::get_build_logs))
        // Event history
        .route("/events", get(event::list_events))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
