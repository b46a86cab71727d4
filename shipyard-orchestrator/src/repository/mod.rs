//! Repository Module
//!
//! Data access layer for the orchestrator. Each entity has a repository trait
//! with a Postgres implementation and an in-memory implementation used by
//! tests and `SHIPYARD_STORAGE=memory`.

pub mod build;
pub mod deployment;
pub mod memory;
pub mod service;
pub mod workflow;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipyard_core::domain::build::Build;
use shipyard_core::domain::deployment::Deployment;
use shipyard_core::domain::service::Service;
use shipyard_core::domain::workflow::{Workflow, WorkflowStatus};
use shipyard_core::dto::workflow::WorkflowQuery;
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub use memory::InMemoryStore;

/// Default page size when a listing query sets no limit
pub const DEFAULT_LIST_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A uniqueness constraint rejected the write
    #[error("conflict: {0}")]
    Conflict(String),

    /// A referenced row does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
}

pub type RepoResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait ServiceRepository: Send + Sync {
    async fn create(&self, service: &Service) -> RepoResult<()>;

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Service>>;

    /// Services whose build source tracks `repository_url` at `branch`
    async fn find_tracking(&self, repository_url: &str, branch: &str) -> RepoResult<Vec<Service>>;

    /// Persist status and current build/deployment/version pointers
    async fn update(&self, service: &Service) -> RepoResult<()>;
}

#[async_trait]
pub trait BuildRepository: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Build>>;

    /// Persist a build unless the stored row is already terminal.
    ///
    /// Returns `false` without writing when it is; a finished build is never
    /// rewritten.
    async fn update(&self, build: &Build) -> RepoResult<bool>;
}

#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    async fn create(&self, deployment: &Deployment) -> RepoResult<()>;

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Deployment>>;

    /// Persist a deployment if its stored status accepts the new one (see
    /// [`DeploymentStatus::accepts`]). Returns `false` without writing otherwise.
    ///
    /// [`DeploymentStatus::accepts`]: shipyard_core::domain::deployment::DeploymentStatus::accepts
    async fn update(&self, deployment: &Deployment) -> RepoResult<bool>;

    /// Most recent succeeded deployment of a service created before `before`
    async fn find_previous_succeeded(
        &self,
        service_id: Uuid,
        before: DateTime<Utc>,
    ) -> RepoResult<Option<Deployment>>;
}

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Insert a workflow together with its first build.
    ///
    /// Fails with [`RepositoryError::Conflict`] when an active workflow
    /// already holds the same `(service_id, commit_sha)` key; nothing is
    /// written in that case.
    async fn create_with_build(&self, workflow: &Workflow, build: &Build) -> RepoResult<()>;

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Workflow>>;

    /// The active workflow for an idempotency key, if any
    async fn find_active(&self, service_id: Uuid, commit_sha: &str)
    -> RepoResult<Option<Workflow>>;

    async fn find_by_build(&self, build_id: Uuid) -> RepoResult<Option<Workflow>>;

    /// Newest first
    async fn list(&self, query: &WorkflowQuery) -> RepoResult<Vec<Workflow>>;

    /// Oldest activity first
    async fn list_by_status(&self, statuses: &[WorkflowStatus]) -> RepoResult<Vec<Workflow>>;

    /// Active workflows with no activity since `inactive_since`
    async fn find_stale(&self, inactive_since: DateTime<Utc>) -> RepoResult<Vec<Workflow>>;

    /// Compare-and-swap on `version`.
    ///
    /// Returns `false` without writing when the stored version no longer
    /// matches, i.e. another writer got there first. On success the stored and
    /// in-memory versions are both incremented.
    async fn update(&self, workflow: &mut Workflow) -> RepoResult<bool>;

    /// Delete terminal workflows last updated before `cutoff`
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> RepoResult<u64>;
}

/// All repositories the orchestrator needs, behind trait objects
#[derive(Clone)]
pub struct Repositories {
    pub services: Arc<dyn ServiceRepository>,
    pub builds: Arc<dyn BuildRepository>,
    pub deployments: Arc<dyn DeploymentRepository>,
    pub workflows: Arc<dyn WorkflowRepository>,
}

impl Repositories {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            services: Arc::new(service::PgServiceRepository::new(pool.clone())),
            builds: Arc::new(build::PgBuildRepository::new(pool.clone())),
            deployments: Arc::new(deployment::PgDeploymentRepository::new(pool.clone())),
            workflows: Arc::new(workflow::PgWorkflowRepository::new(pool)),
        }
    }

    pub fn in_memory() -> Self {
        Self::from_store(Arc::new(InMemoryStore::new()))
    }

    pub fn from_store(store: Arc<InMemoryStore>) -> Self {
        Self {
            services: store.clone(),
            builds: store.clone(),
            deployments: store.clone(),
            workflows: store,
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
