//! In-memory repositories
//!
//! One store backs all four repository traits so that multi-entity writes
//! (workflow plus first build) are atomic under a single lock, mirroring the
//! Postgres transaction and partial unique index.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipyard_core::domain::build::Build;
use shipyard_core::domain::deployment::{Deployment, DeploymentStatus};
use shipyard_core::domain::service::Service;
use shipyard_core::domain::workflow::{Workflow, WorkflowStatus};
use shipyard_core::dto::workflow::WorkflowQuery;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    BuildRepository, DEFAULT_LIST_LIMIT, DeploymentRepository, RepoResult, RepositoryError,
    ServiceRepository, WorkflowRepository,
};

#[derive(Default)]
struct State {
    services: HashMap<Uuid, Service>,
    builds: HashMap<Uuid, Build>,
    deployments: HashMap<Uuid, Deployment>,
    workflows: HashMap<Uuid, Workflow>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceRepository for InMemoryStore {
    async fn create(&self, service: &Service) -> RepoResult<()> {
        let mut state = self.state.lock().await;
        if state.services.contains_key(&service.id) {
            return Err(RepositoryError::Conflict(format!(
                "service {} already exists",
                service.id
            )));
        }
        state.services.insert(service.id, service.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Service>> {
        Ok(self.state.lock().await.services.get(&id).cloned())
    }

    async fn find_tracking(&self, repository_url: &str, branch: &str) -> RepoResult<Vec<Service>> {
        let state = self.state.lock().await;
        Ok(state
            .services
            .values()
            .filter(|s| s.source.tracks(repository_url, branch))
            .cloned()
            .collect())
    }

    async fn update(&self, service: &Service) -> RepoResult<()> {
        let mut state = self.state.lock().await;
        match state.services.get_mut(&service.id) {
            Some(stored) => {
                *stored = service.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound {
                entity: "service",
                id: service.id,
            }),
        }
    }
}

#[async_trait]
impl BuildRepository for InMemoryStore {
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Build>> {
        Ok(self.state.lock().await.builds.get(&id).cloned())
    }

    async fn update(&self, build: &Build) -> RepoResult<bool> {
        let mut state = self.state.lock().await;
        match state.builds.get_mut(&build.id) {
            Some(stored) if stored.status.is_terminal() => Ok(false),
            Some(stored) => {
                *stored = build.clone();
                Ok(true)
            }
            None => Err(RepositoryError::NotFound {
                entity: "build",
                id: build.id,
            }),
        }
    }
}

#[async_trait]
impl DeploymentRepository for InMemoryStore {
    async fn create(&self, deployment: &Deployment) -> RepoResult<()> {
        let mut state = self.state.lock().await;
        if !state.builds.contains_key(&deployment.build_id) {
            return Err(RepositoryError::NotFound {
                entity: "build",
                id: deployment.build_id,
            });
        }
        state.deployments.insert(deployment.id, deployment.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Deployment>> {
        Ok(self.state.lock().await.deployments.get(&id).cloned())
    }

    async fn update(&self, deployment: &Deployment) -> RepoResult<bool> {
        let mut state = self.state.lock().await;
        match state.deployments.get_mut(&deployment.id) {
            Some(stored) if !stored.status.accepts(deployment.status) => Ok(false),
            Some(stored) => {
                *stored = deployment.clone();
                Ok(true)
            }
            None => Err(RepositoryError::NotFound {
                entity: "deployment",
                id: deployment.id,
            }),
        }
    }

    async fn find_previous_succeeded(
        &self,
        service_id: Uuid,
        before: DateTime<Utc>,
    ) -> RepoResult<Option<Deployment>> {
        let state = self.state.lock().await;
        Ok(state
            .deployments
            .values()
            .filter(|d| {
                d.service_id == service_id
                    && d.status == DeploymentStatus::Succeeded
                    && d.created_at < before
            })
            .max_by_key(|d| d.created_at)
            .cloned())
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryStore {
    async fn create_with_build(&self, workflow: &Workflow, build: &Build) -> RepoResult<()> {
        let mut state = self.state.lock().await;

        if !state.services.contains_key(&workflow.service_id) {
            return Err(RepositoryError::NotFound {
                entity: "service",
                id: workflow.service_id,
            });
        }

        let (service_id, commit_sha) = workflow.idempotency_key();
        let taken = workflow.status.is_active()
            && state.workflows.values().any(|w| {
                w.status.is_active()
                    && w.service_id == service_id
                    && w.trigger.commit_sha == commit_sha
            });
        if taken {
            return Err(RepositoryError::Conflict(format!(
                "active workflow exists for service {} at {}",
                service_id, commit_sha
            )));
        }

        state.builds.insert(build.id, build.clone());
        state.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<Workflow>> {
        Ok(self.state.lock().await.workflows.get(&id).cloned())
    }

    async fn find_active(
        &self,
        service_id: Uuid,
        commit_sha: &str,
    ) -> RepoResult<Option<Workflow>> {
        let state = self.state.lock().await;
        Ok(state
            .workflows
            .values()
            .find(|w| {
                w.status.is_active()
                    && w.service_id == service_id
                    && w.trigger.commit_sha == commit_sha
            })
            .cloned())
    }

    async fn find_by_build(&self, build_id: Uuid) -> RepoResult<Option<Workflow>> {
        let state = self.state.lock().await;
        Ok(state
            .workflows
            .values()
            .find(|w| w.build_id == build_id)
            .cloned())
    }

    async fn list(&self, query: &WorkflowQuery) -> RepoResult<Vec<Workflow>> {
        let state = self.state.lock().await;
        let mut workflows: Vec<Workflow> = state
            .workflows
            .values()
            .filter(|w| query.service_id.is_none_or(|id| w.service_id == id))
            .filter(|w| query.status.is_none_or(|s| w.status == s))
            .cloned()
            .collect();

        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        workflows.truncate(query.limit.unwrap_or(DEFAULT_LIST_LIMIT));
        Ok(workflows)
    }

    async fn list_by_status(&self, statuses: &[WorkflowStatus]) -> RepoResult<Vec<Workflow>> {
        let state = self.state.lock().await;
        let mut workflows: Vec<Workflow> = state
            .workflows
            .values()
            .filter(|w| statuses.contains(&w.status))
            .cloned()
            .collect();

        workflows.sort_by_key(|w| w.last_activity_at);
        Ok(workflows)
    }

    async fn find_stale(&self, inactive_since: DateTime<Utc>) -> RepoResult<Vec<Workflow>> {
        let state = self.state.lock().await;
        let mut workflows: Vec<Workflow> = state
            .workflows
            .values()
            .filter(|w| w.status.is_active() && w.last_activity_at < inactive_since)
            .cloned()
            .collect();

        workflows.sort_by_key(|w| w.last_activity_at);
        Ok(workflows)
    }

    async fn update(&self, workflow: &mut Workflow) -> RepoResult<bool> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.workflows.get_mut(&workflow.id) else {
            return Err(RepositoryError::NotFound {
                entity: "workflow",
                id: workflow.id,
            });
        };

        if stored.version != workflow.version {
            return Ok(false);
        }

        workflow.version += 1;
        *stored = workflow.clone();
        Ok(true)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> RepoResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.workflows.len();
        state
            .workflows
            .retain(|_, w| !(w.status.is_terminal() && w.updated_at < cutoff));
        Ok((before - state.workflows.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::service;
    use chrono::Duration;
    use shipyard_core::domain::build::BuildStatus;
    use shipyard_core::domain::workflow::{Trigger, TriggerKind};

    fn workflow_for(service_id: Uuid, sha: &str) -> (Workflow, Build) {
        let build = Build::queued(service_id, sha);
        let trigger = Trigger {
            kind: TriggerKind::Manual,
            provider: None,
            delivery_id: None,
            commit_sha: sha.to_string(),
            branch: "main".to_string(),
        };
        (Workflow::pending(service_id, build.id, trigger), build)
    }

    #[tokio::test]
    async fn test_active_key_is_unique() {
        let store = InMemoryStore::new();
        let svc = service();
        ServiceRepository::create(&store, &svc).await.unwrap();

        let (first, first_build) = workflow_for(svc.id, "abc123");
        store.create_with_build(&first, &first_build).await.unwrap();

        let (second, second_build) = workflow_for(svc.id, "abc123");
        let err = store
            .create_with_build(&second, &second_build)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        // The rejected build was not written
        assert!(BuildRepository::find_by_id(&store, second_build.id)
            .await
            .unwrap()
            .is_none());

        // A different commit is independent
        let (other, other_build) = workflow_for(svc.id, "def456");
        store.create_with_build(&other, &other_build).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminal_workflow_frees_key() {
        let store = InMemoryStore::new();
        let svc = service();
        ServiceRepository::create(&store, &svc).await.unwrap();

        let (mut first, build) = workflow_for(svc.id, "abc123");
        store.create_with_build(&first, &build).await.unwrap();
        first.fail("boom", Utc::now()).unwrap();
        assert!(WorkflowRepository::update(&store, &mut first).await.unwrap());

        let (retry, retry_build) = workflow_for(svc.id, "abc123");
        store.create_with_build(&retry, &retry_build).await.unwrap();
        assert_eq!(
            store.find_active(svc.id, "abc123").await.unwrap().map(|w| w.id),
            Some(retry.id)
        );
    }

    #[tokio::test]
    async fn test_update_rejects_stale_version() {
        let store = InMemoryStore::new();
        let svc = service();
        ServiceRepository::create(&store, &svc).await.unwrap();

        let (workflow, build) = workflow_for(svc.id, "abc123");
        store.create_with_build(&workflow, &build).await.unwrap();

        let mut a = workflow.clone();
        let mut b = workflow.clone();

        a.transition(WorkflowStatus::Building, Utc::now()).unwrap();
        assert!(WorkflowRepository::update(&store, &mut a).await.unwrap());
        assert_eq!(a.version, 1);

        b.fail("late writer", Utc::now()).unwrap();
        assert!(!WorkflowRepository::update(&store, &mut b).await.unwrap());
        assert_eq!(b.version, 0);

        let stored = WorkflowRepository::find_by_id(&store, workflow.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, WorkflowStatus::Building);
    }

    #[tokio::test]
    async fn test_stale_and_retention_queries() {
        let store = InMemoryStore::new();
        let svc = service();
        ServiceRepository::create(&store, &svc).await.unwrap();
        let now = Utc::now();

        let (mut old_active, b1) = workflow_for(svc.id, "a1");
        old_active.last_activity_at = now - Duration::hours(30);
        store.create_with_build(&old_active, &b1).await.unwrap();

        let (mut old_done, b2) = workflow_for(svc.id, "a2");
        old_done.status = WorkflowStatus::Failed;
        old_done.updated_at = now - Duration::hours(30);
        old_done.last_activity_at = old_done.updated_at;
        store.create_with_build(&old_done, &b2).await.unwrap();

        let (fresh, b3) = workflow_for(svc.id, "a3");
        store.create_with_build(&fresh, &b3).await.unwrap();

        let stale = store.find_stale(now - Duration::hours(24)).await.unwrap();
        assert_eq!(stale.iter().map(|w| w.id).collect::<Vec<_>>(), vec![old_active.id]);

        let deleted = store
            .delete_terminal_before(now - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(WorkflowRepository::find_by_id(&store, old_done.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_finished_build_is_not_overwritten() {
        let store = InMemoryStore::new();
        let svc = service();
        ServiceRepository::create(&store, &svc).await.unwrap();
        let (workflow, build) = workflow_for(svc.id, "abc123");
        store.create_with_build(&workflow, &build).await.unwrap();

        // A poller read the build while it was still queued
        let mut stale = build.clone();
        stale.status = BuildStatus::Running;

        let mut done = build.clone();
        done.status = BuildStatus::Succeeded;
        done.artifact = Some("img:abc123".to_string());
        assert!(BuildRepository::update(&store, &done).await.unwrap());

        assert!(!BuildRepository::update(&store, &stale).await.unwrap());
        let stored = BuildRepository::find_by_id(&store, build.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, BuildStatus::Succeeded);
        assert_eq!(stored.artifact.as_deref(), Some("img:abc123"));

        let missing = Build::queued(svc.id, "def456");
        assert!(matches!(
            BuildRepository::update(&store, &missing).await.unwrap_err(),
            RepositoryError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_finished_deployment_only_rolls_back() {
        let store = InMemoryStore::new();
        let svc = service();
        ServiceRepository::create(&store, &svc).await.unwrap();
        let (workflow, build) = workflow_for(svc.id, "abc123");
        store.create_with_build(&workflow, &build).await.unwrap();

        let mut deployment = Deployment {
            id: Uuid::new_v4(),
            service_id: svc.id,
            build_id: build.id,
            status: DeploymentStatus::Pending,
            external_id: None,
            revision: None,
            version: "img:abc123".to_string(),
            replicas: 1,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        DeploymentRepository::create(&store, &deployment).await.unwrap();

        deployment.status = DeploymentStatus::Failed;
        deployment.error = Some("sync failed".to_string());
        assert!(DeploymentRepository::update(&store, &deployment).await.unwrap());

        let mut late = deployment.clone();
        late.status = DeploymentStatus::InProgress;
        late.external_id = Some("billing-api".to_string());
        assert!(!DeploymentRepository::update(&store, &late).await.unwrap());

        let stored = DeploymentRepository::find_by_id(&store, deployment.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, DeploymentStatus::Failed);
        assert!(stored.external_id.is_none());

        // A failed deployment cannot be rolled back either
        late.status = DeploymentStatus::RolledBack;
        assert!(!DeploymentRepository::update(&store, &late).await.unwrap());
    }

    #[tokio::test]
    async fn test_previous_succeeded_deployment() {
        let store = InMemoryStore::new();
        let svc = service();
        ServiceRepository::create(&store, &svc).await.unwrap();
        let (workflow, build) = workflow_for(svc.id, "abc");
        store.create_with_build(&workflow, &build).await.unwrap();

        let now = Utc::now();
        let deployment = |status, age_minutes: i64| Deployment {
            id: Uuid::new_v4(),
            service_id: svc.id,
            build_id: build.id,
            status,
            external_id: None,
            revision: None,
            version: format!("v{}", age_minutes),
            replicas: 1,
            error: None,
            created_at: now - Duration::minutes(age_minutes),
            finished_at: None,
        };

        let oldest = deployment(DeploymentStatus::Succeeded, 30);
        let failed = deployment(DeploymentStatus::Failed, 20);
        let current = deployment(DeploymentStatus::Succeeded, 10);
        for d in [&oldest, &failed, &current] {
            DeploymentRepository::create(&store, d).await.unwrap();
        }

        let previous = store
            .find_previous_succeeded(svc.id, current.created_at)
            .await
            .unwrap();
        assert_eq!(previous.map(|d| d.id), Some(oldest.id));
    }
}
