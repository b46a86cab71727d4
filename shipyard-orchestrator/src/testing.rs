//! Fixtures and scripted fake ports shared by unit tests

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use shipyard_core::domain::build::{Build, BuildStatus};
use shipyard_core::domain::service::{BuildKind, BuildSource, Service, ServiceStatus};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::bus::{EventBus, EventBusConfig, InMemoryEventBus};
use crate::ports::retry::RetryPolicy;
use crate::ports::{
    ApplicationStatus, BuildReport, CiPort, Environment, GitOpsPort, HealthStatus, LogStream,
    PortError, SyncStatus,
};
use crate::repository::Repositories;
use crate::service::orchestrator::Orchestrator;
use shipyard_core::dto::workflow::EventQuery;
use std::time::Duration;

pub const REPOSITORY_URL: &str = "https://github.com/acme/billing-api.git";

/// A service tracking `main` of acme/billing-api
pub fn service() -> Service {
    let now = Utc::now();
    Service {
        id: Uuid::new_v4(),
        project_id: Uuid::new_v4(),
        name: "Billing API".to_string(),
        slug: "billing-api".to_string(),
        source: BuildSource {
            repository_url: REPOSITORY_URL.to_string(),
            branch: "main".to_string(),
            kind: BuildKind::Dockerfile,
        },
        status: ServiceStatus::Pending,
        current_build_id: None,
        current_deployment_id: None,
        current_version: None,
        created_at: now,
        updated_at: now,
    }
}

/// Serve `router` on an ephemeral local port and return its base URL
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Retries fast enough for tests
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        call_timeout: Duration::from_secs(1),
    }
}

/// Orchestrator wired to in-memory storage, an in-memory bus and fake ports
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub repos: Repositories,
    pub bus: Arc<InMemoryEventBus>,
    pub ci: Arc<FakeCi>,
    pub gitops: Arc<FakeGitOps>,
    pub service: Service,
}

impl Harness {
    pub async fn new() -> Self {
        let repos = Repositories::in_memory();
        let service = service();
        repos.services.create(&service).await.unwrap();

        let bus = Arc::new(InMemoryEventBus::new(EventBusConfig {
            redelivery_backoff: Duration::from_millis(5),
            ..Default::default()
        }));
        let ci = FakeCi::new();
        let gitops = FakeGitOps::new();
        let orchestrator = Arc::new(Orchestrator::new(
            repos.clone(),
            bus.clone(),
            ci.clone(),
            gitops.clone(),
            fast_retry(),
            "apps",
        ));

        Self {
            orchestrator,
            repos,
            bus,
            ci,
            gitops,
            service,
        }
    }
}

/// Event types in the bus history, oldest first
pub async fn event_types(bus: &InMemoryEventBus) -> Vec<String> {
    bus.history(&EventQuery::default())
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.event.event_type)
        .collect()
}

/// Poll `check` until it holds or a second passes
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 1s");
}

// =============================================================================
// Fake CI
// =============================================================================

#[derive(Default)]
pub struct FakeCiState {
    /// Build ids passed to `trigger_build`, in call order
    pub triggered: Vec<Uuid>,
    pub canceled: Vec<String>,
    /// Errors returned by the next trigger calls
    pub trigger_failures: VecDeque<PortError>,
    pub reports: HashMap<String, BuildReport>,
}

#[derive(Default)]
pub struct FakeCi {
    pub state: Mutex<FakeCiState>,
}

impl FakeCi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn external_id(build_id: Uuid) -> String {
        format!("ci-{}", build_id)
    }

    pub async fn fail_next_triggers(&self, errors: impl IntoIterator<Item = PortError>) {
        self.state.lock().await.trigger_failures.extend(errors);
    }

    /// Make the CI report `status` for `build_id` from now on
    pub async fn finish(&self, build_id: Uuid, status: BuildStatus, artifact: Option<&str>) {
        let external_id = Self::external_id(build_id);
        self.state.lock().await.reports.insert(
            external_id.clone(),
            BuildReport {
                external_id,
                status,
                artifact: artifact.map(str::to_string),
                error: (status == BuildStatus::Failed).then(|| "exit status 1".to_string()),
            },
        );
    }

    pub async fn triggered(&self) -> Vec<Uuid> {
        self.state.lock().await.triggered.clone()
    }

    pub async fn canceled(&self) -> Vec<String> {
        self.state.lock().await.canceled.clone()
    }
}

#[async_trait]
impl CiPort for FakeCi {
    async fn trigger_build(&self, _service: &Service, build: &Build) -> Result<BuildReport, PortError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.trigger_failures.pop_front() {
            return Err(err);
        }

        state.triggered.push(build.id);
        let report = BuildReport {
            external_id: Self::external_id(build.id),
            status: BuildStatus::Running,
            artifact: None,
            error: None,
        };
        state
            .reports
            .entry(report.external_id.clone())
            .or_insert_with(|| report.clone());
        Ok(report)
    }

    async fn get_build_status(&self, external_id: &str) -> Result<BuildReport, PortError> {
        self.state
            .lock()
            .await
            .reports
            .get(external_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(external_id.to_string()))
    }

    async fn cancel_build(&self, external_id: &str) -> Result<(), PortError> {
        let mut state = self.state.lock().await;
        state.canceled.push(external_id.to_string());
        if let Some(report) = state.reports.get_mut(external_id) {
            report.status = BuildStatus::Canceled;
        }
        Ok(())
    }

    async fn get_build_logs(&self, external_id: &str) -> Result<LogStream, PortError> {
        let lines = vec![
            Ok("cloning repository".to_string()),
            Ok(format!("building {}", external_id)),
        ];
        Ok(Box::pin(futures::stream::iter(lines)))
    }
}

// =============================================================================
// Fake GitOps
// =============================================================================

#[derive(Default)]
pub struct FakeGitOpsState {
    pub applied: Vec<(String, Environment)>,
    pub synced: Vec<String>,
    pub rollbacks: Vec<(String, String)>,
    pub sync_failures: VecDeque<PortError>,
    pub rollback_failures: VecDeque<PortError>,
    pub statuses: HashMap<String, ApplicationStatus>,
}

#[derive(Default)]
pub struct FakeGitOps {
    pub state: Mutex<FakeGitOpsState>,
}

impl FakeGitOps {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn fail_next_syncs(&self, errors: impl IntoIterator<Item = PortError>) {
        self.state.lock().await.sync_failures.extend(errors);
    }

    pub async fn fail_next_rollbacks(&self, errors: impl IntoIterator<Item = PortError>) {
        self.state.lock().await.rollback_failures.extend(errors);
    }

    pub async fn set_status(&self, external_id: &str, health: HealthStatus, sync: SyncStatus) {
        self.state.lock().await.statuses.insert(
            external_id.to_string(),
            ApplicationStatus {
                health,
                sync,
                revision: None,
                message: (health == HealthStatus::Degraded)
                    .then(|| "CrashLoopBackOff".to_string()),
            },
        );
    }

    pub async fn synced(&self) -> Vec<String> {
        self.state.lock().await.synced.clone()
    }

    pub async fn rollbacks(&self) -> Vec<(String, String)> {
        self.state.lock().await.rollbacks.clone()
    }
}

#[async_trait]
impl GitOpsPort for FakeGitOps {
    async fn create_or_update_application(
        &self,
        service: &Service,
        environment: &Environment,
    ) -> Result<String, PortError> {
        self.state
            .lock()
            .await
            .applied
            .push((service.slug.clone(), environment.clone()));
        Ok(service.slug.clone())
    }

    async fn sync_application(&self, external_id: &str) -> Result<(), PortError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.sync_failures.pop_front() {
            return Err(err);
        }
        state.synced.push(external_id.to_string());
        Ok(())
    }

    async fn get_application_status(
        &self,
        external_id: &str,
    ) -> Result<ApplicationStatus, PortError> {
        Ok(self
            .state
            .lock()
            .await
            .statuses
            .get(external_id)
            .cloned()
            .unwrap_or(ApplicationStatus {
                health: HealthStatus::Progressing,
                sync: SyncStatus::OutOfSync,
                revision: None,
                message: None,
            }))
    }

    async fn rollback(&self, external_id: &str, revision: &str) -> Result<(), PortError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.rollback_failures.pop_front() {
            return Err(err);
        }
        state
            .rollbacks
            .push((external_id.to_string(), revision.to_string()));
        Ok(())
    }
}

// =============================================================================
// Webhook fixtures
// =============================================================================

pub const WEBHOOK_SECRET: &str = "It's a Secret to Everybody";

/// GitHub push payload for acme/billing-api `main` at `after`
pub fn github_push(after: &str) -> String {
    serde_json::json!({
        "ref": "refs/heads/main",
        "before": "9049f1265b7d61be4a8904a9a27120d2064dab3b",
        "after": after,
        "repository": {
            "id": 186853002,
            "full_name": "acme/billing-api",
            "clone_url": REPOSITORY_URL,
            "default_branch": "main"
        },
        "pusher": { "name": "octocat" },
        "sender": { "login": "octocat" },
        "commits": [{
            "id": after,
            "message": "Fix invoice rounding",
            "timestamp": "2025-05-05T19:40:15-04:00",
            "url": "https://github.com/acme/billing-api/commit/0d1a26e",
            "author": { "name": "Mona" }
        }]
    })
    .to_string()
}

pub fn github_registry() -> shipyard_providers::ProviderRegistry {
    let mut registry = shipyard_providers::ProviderRegistry::new();
    registry.register(Arc::new(shipyard_providers::GitHubProvider::new(
        Default::default(),
    )));
    registry
}

/// `X-Hub-Signature-256` value for `body`
pub fn github_signature(body: &str) -> String {
    format!(
        "sha256={}",
        shipyard_providers::signature::hmac_sha256_hex(WEBHOOK_SECRET.as_bytes(), body.as_bytes())
    )
}
