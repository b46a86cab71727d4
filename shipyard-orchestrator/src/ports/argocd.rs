//! GitOps Port adapter for Argo CD
//!
//! One Argo CD application per service, named after the service slug. The
//! manifests live in the service repository under [`MANIFEST_PATH`]; the built
//! image is injected as a kustomize image override.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use shipyard_core::domain::service::Service;

use super::{
    ApplicationStatus, Environment, GitOpsPort, HealthStatus, PortError, SyncStatus,
    error_for_status,
};

const SYSTEM: &str = "argocd";

/// Directory of the service repository holding its kustomization
pub const MANIFEST_PATH: &str = "deploy";

const IN_CLUSTER: &str = "https://kubernetes.default.svc";

#[derive(Debug, Clone)]
pub struct ArgoCdClient {
    base_url: String,
    token: String,
    project: String,
    client: Client,
}

// =============================================================================
// Argo CD API shapes
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct Application {
    metadata: Metadata,
    #[serde(skip_deserializing, skip_serializing_if = "Option::is_none")]
    spec: Option<ApplicationSpec>,
    #[serde(default, skip_serializing)]
    status: Option<AppStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApplicationSpec {
    project: String,
    source: Source,
    destination: Destination,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Source {
    #[serde(rename = "repoURL")]
    repo_url: String,
    target_revision: String,
    path: String,
    kustomize: Kustomize,
}

#[derive(Debug, Serialize)]
struct Kustomize {
    images: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Destination {
    server: String,
    namespace: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppStatus {
    #[serde(default)]
    health: Option<AppHealth>,
    #[serde(default)]
    sync: Option<AppSync>,
    #[serde(default)]
    history: Vec<HistoryEntry>,
    #[serde(default)]
    operation_state: Option<OperationState>,
}

#[derive(Debug, Deserialize)]
struct AppHealth {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AppSync {
    status: String,
    #[serde(default)]
    revision: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    id: i64,
    revision: String,
}

#[derive(Debug, Deserialize)]
struct OperationState {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize)]
struct SyncRequest {
    prune: bool,
}

#[derive(Debug, Serialize)]
struct RollbackRequest {
    id: i64,
    prune: bool,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_health(raw: &str) -> HealthStatus {
    match raw {
        "Healthy" => HealthStatus::Healthy,
        "Progressing" => HealthStatus::Progressing,
        "Degraded" => HealthStatus::Degraded,
        "Suspended" => HealthStatus::Suspended,
        "Missing" => HealthStatus::Missing,
        _ => HealthStatus::Unknown,
    }
}

fn parse_sync(raw: &str) -> SyncStatus {
    match raw {
        "Synced" => SyncStatus::Synced,
        "OutOfSync" => SyncStatus::OutOfSync,
        _ => SyncStatus::Unknown,
    }
}

impl From<AppStatus> for ApplicationStatus {
    fn from(status: AppStatus) -> Self {
        let health = status.health.as_ref().map(|h| parse_health(&h.status));
        let message = status
            .operation_state
            .and_then(|op| op.message)
            .or_else(|| status.health.and_then(|h| h.message));

        Self {
            health: health.unwrap_or(HealthStatus::Unknown),
            sync: status
                .sync
                .as_ref()
                .map(|s| parse_sync(&s.status))
                .unwrap_or(SyncStatus::Unknown),
            revision: status.sync.and_then(|s| s.revision),
            message,
        }
    }
}

impl ArgoCdClient {
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        project: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            project: project.into(),
            client: Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/api/v1{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, PortError> {
        let response = request.send().await.map_err(PortError::from_reqwest)?;
        error_for_status(SYSTEM, response).await
    }

    async fn get_application(&self, name: &str) -> Result<Application, PortError> {
        let path = format!("/applications/{}", name);
        self.send(self.request(reqwest::Method::GET, &path))
            .await?
            .json()
            .await
            .map_err(PortError::from_reqwest)
    }
}

#[async_trait]
impl GitOpsPort for ArgoCdClient {
    async fn create_or_update_application(
        &self,
        service: &Service,
        environment: &Environment,
    ) -> Result<String, PortError> {
        let application = Application {
            metadata: Metadata {
                name: service.slug.clone(),
            },
            spec: Some(ApplicationSpec {
                project: self.project.clone(),
                source: Source {
                    repo_url: service.source.repository_url.clone(),
                    target_revision: environment.revision.clone(),
                    path: MANIFEST_PATH.to_string(),
                    kustomize: Kustomize {
                        images: vec![environment.image.clone()],
                    },
                },
                destination: Destination {
                    server: IN_CLUSTER.to_string(),
                    namespace: environment.namespace.clone(),
                },
            }),
            status: None,
        };

        let created: Application = self
            .send(
                self.request(reqwest::Method::POST, "/applications?upsert=true")
                    .json(&application),
            )
            .await?
            .json()
            .await
            .map_err(PortError::from_reqwest)?;

        tracing::debug!("Argo CD application {} upserted", created.metadata.name);
        Ok(created.metadata.name)
    }

    async fn sync_application(&self, external_id: &str) -> Result<(), PortError> {
        let path = format!("/applications/{}/sync", external_id);
        self.send(
            self.request(reqwest::Method::POST, &path)
                .json(&SyncRequest { prune: false }),
        )
        .await?;
        Ok(())
    }

    async fn get_application_status(
        &self,
        external_id: &str,
    ) -> Result<ApplicationStatus, PortError> {
        let application = self.get_application(external_id).await?;
        Ok(application.status.unwrap_or_default().into())
    }

    async fn rollback(&self, external_id: &str, revision: &str) -> Result<(), PortError> {
        // Argo CD rolls back to a history entry, not to a revision
        let application = self.get_application(external_id).await?;
        let history_id = application
            .status
            .unwrap_or_default()
            .history
            .iter()
            .rev()
            .find(|entry| entry.revision == revision)
            .map(|entry| entry.id)
            .ok_or_else(|| {
                PortError::NotFound(format!(
                    "revision {} in history of {}",
                    revision, external_id
                ))
            })?;

        let path = format!("/applications/{}/rollback", external_id);
        self.send(self.request(reqwest::Method::POST, &path).json(&RollbackRequest {
            id: history_id,
            prune: false,
        }))
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::RolloutOutcome;
    use crate::testing::{serve, service};
    use axum::{
        Json, Router,
        routing::{get, post},
    };
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn environment() -> Environment {
        Environment {
            namespace: "prod".to_string(),
            image: "registry.local/billing-api:abc123".to_string(),
            revision: "abc123".to_string(),
        }
    }

    #[tokio::test]
    async fn test_upsert_application() {
        let seen = Arc::new(Mutex::new(None::<serde_json::Value>));
        let captured = seen.clone();

        let router = Router::new().route(
            "/api/v1/applications",
            post(move |Json(body): Json<serde_json::Value>| {
                let captured = captured.clone();
                async move {
                    *captured.lock().await = Some(body.clone());
                    Json(body)
                }
            }),
        );
        let client = ArgoCdClient::new(serve(router).await, "argo-token", "shipyard");

        let svc = service();
        let name = client
            .create_or_update_application(&svc, &environment())
            .await
            .unwrap();
        assert_eq!(name, svc.slug);

        let body = seen.lock().await.take().unwrap();
        assert_eq!(body["spec"]["project"], "shipyard");
        assert_eq!(body["spec"]["source"]["repoURL"], svc.source.repository_url);
        assert_eq!(body["spec"]["source"]["targetRevision"], "abc123");
        assert_eq!(
            body["spec"]["source"]["kustomize"]["images"][0],
            "registry.local/billing-api:abc123"
        );
        assert_eq!(body["spec"]["destination"]["namespace"], "prod");
    }

    #[tokio::test]
    async fn test_application_status() {
        let router = Router::new().route(
            "/api/v1/applications/{name}",
            get(|| async {
                Json(serde_json::json!({
                    "metadata": {"name": "billing-api"},
                    "status": {
                        "health": {"status": "Healthy"},
                        "sync": {"status": "Synced", "revision": "abc123"}
                    }
                }))
            }),
        );
        let client = ArgoCdClient::new(serve(router).await, "t", "default");

        let status = client.get_application_status("billing-api").await.unwrap();
        assert_eq!(status.health, HealthStatus::Healthy);
        assert_eq!(status.sync, SyncStatus::Synced);
        assert_eq!(status.revision.as_deref(), Some("abc123"));
        assert_eq!(status.outcome(), RolloutOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_rollback_resolves_history_id() {
        let rolled_to = Arc::new(Mutex::new(None::<i64>));
        let captured = rolled_to.clone();

        let router = Router::new()
            .route(
                "/api/v1/applications/{name}",
                get(|| async {
                    Json(serde_json::json!({
                        "metadata": {"name": "billing-api"},
                        "status": {
                            "history": [
                                {"id": 3, "revision": "old111"},
                                {"id": 4, "revision": "abc123"}
                            ]
                        }
                    }))
                }),
            )
            .route(
                "/api/v1/applications/{name}/rollback",
                post(move |Json(body): Json<serde_json::Value>| {
                    let captured = captured.clone();
                    async move {
                        *captured.lock().await = body["id"].as_i64();
                        Json(serde_json::json!({}))
                    }
                }),
            );
        let client = ArgoCdClient::new(serve(router).await, "t", "default");

        client.rollback("billing-api", "old111").await.unwrap();
        assert_eq!(*rolled_to.lock().await, Some(3));

        let err = client.rollback("billing-api", "never").await.unwrap_err();
        assert!(matches!(err, PortError::NotFound(_)));
    }

    #[test]
    fn test_unknown_vocabulary_is_not_an_error() {
        assert_eq!(parse_health("Exploding"), HealthStatus::Unknown);
        assert_eq!(parse_sync(""), SyncStatus::Unknown);
        assert_eq!(
            ApplicationStatus::from(AppStatus::default()).outcome(),
            RolloutOutcome::InProgress
        );
    }
}
