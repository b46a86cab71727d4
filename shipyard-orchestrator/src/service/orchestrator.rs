//! Orchestration state machine
//!
//! Drives each Workflow through `Pending -> Building -> Deploying -> Succeeded`
//! and its child Build and Deployment through their own lifecycles. Every
//! transition is first claimed with a compare-and-swap on the workflow version
//! and only the winner performs the external side effect, so duplicate
//! signals (bus redelivery, reconciler polls racing event handlers) act once.

use chrono::{DateTime, Utc};
use shipyard_core::domain::build::{Build, BuildStatus};
use shipyard_core::domain::deployment::{Deployment, DeploymentStatus};
use shipyard_core::domain::event::{DomainEvent, META_DELIVERY_ID, types};
use shipyard_core::domain::git::GitEvent;
use shipyard_core::domain::service::{Service, ServiceStatus};
use shipyard_core::domain::workflow::{
    InvalidTransition, Trigger, TriggerKind, Workflow, WorkflowStatus,
};
use shipyard_core::dto::workflow::{TriggerOutcome, TriggerService, WorkflowDetails, WorkflowQuery};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::bus::{BusError, EventBus};
use crate::gateway::META_PROVIDER;
use crate::ports::retry::RetryPolicy;
use crate::ports::{
    ApplicationStatus, BuildReport, CiPort, Environment, GitOpsPort, LogStream, PortError,
    RolloutOutcome,
};
use crate::repository::{Repositories, RepositoryError};

pub const SOURCE: &str = "orchestrator";

pub const CANCELED_REASON: &str = "canceled by operator";

/// Reload-and-retry bound for a contended workflow
const MAX_CLAIM_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("invalid request: {0}")]
    Validation(String),

    /// The request does not apply to the entity's current state
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("dependency failed: {0}")]
    Dependency(#[from] PortError),

    #[error(transparent)]
    Repository(RepositoryError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl OrchestratorError {
    /// Whether processing the same event again later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Repository(_) | Self::Bus(_) | Self::Conflict(_) => true,
            Self::Dependency(e) => e.is_retryable(),
            Self::NotFound { .. } | Self::Validation(_) => false,
        }
    }
}

impl From<RepositoryError> for OrchestratorError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Repository(other),
        }
    }
}

impl From<InvalidTransition> for OrchestratorError {
    fn from(err: InvalidTransition) -> Self {
        Self::Conflict(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Which child entity a failure is recorded against
#[derive(Debug, Clone, Copy)]
enum Stage {
    Build(BuildStatus),
    Deployment,
}

pub struct Orchestrator {
    repos: Repositories,
    bus: Arc<dyn EventBus>,
    ci: Arc<dyn CiPort>,
    gitops: Arc<dyn GitOpsPort>,
    retry: RetryPolicy,
    /// Target namespace of every deployment
    namespace: String,
}

impl Orchestrator {
    pub fn new(
        repos: Repositories,
        bus: Arc<dyn EventBus>,
        ci: Arc<dyn CiPort>,
        gitops: Arc<dyn GitOpsPort>,
        retry: RetryPolicy,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            repos,
            bus,
            ci,
            gitops,
            retry,
            namespace: namespace.into(),
        }
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub(crate) fn ci(&self) -> &Arc<dyn CiPort> {
        &self.ci
    }

    pub(crate) fn gitops(&self) -> &Arc<dyn GitOpsPort> {
        &self.gitops
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// React to a `webhook.received` event.
    ///
    /// Pushes to a tracked branch start (or coalesce into) a workflow for every
    /// service tracking it; merged pull requests are treated as a push of the
    /// merge commit to the base branch. Everything else is ignored.
    pub async fn handle_webhook(&self, event: &DomainEvent) -> Result<Vec<TriggerOutcome>> {
        let git_event: GitEvent = event.payload_field("event").ok_or_else(|| {
            OrchestratorError::Validation(format!("event {} carries no git payload", event.id))
        })?;

        let (branch, commit_sha) = match &git_event {
            GitEvent::Push(push) => {
                if push.deleted {
                    tracing::debug!("Ignoring deletion of {}", push.git_ref);
                    return Ok(Vec::new());
                }
                let Some(branch) = push.branch() else {
                    tracing::debug!("Ignoring push to non-branch ref {}", push.git_ref);
                    return Ok(Vec::new());
                };
                (branch.to_string(), push.after.clone())
            }
            GitEvent::PullRequest(pr) => match &pr.merge_commit_sha {
                Some(sha) if pr.merged && pr.action == "closed" => {
                    (pr.base.name.clone(), sha.clone())
                }
                _ => {
                    tracing::debug!("Ignoring pull request #{} action {}", pr.number, pr.action);
                    return Ok(Vec::new());
                }
            },
        };

        let repository = git_event.repository();
        let services = self
            .repos
            .services
            .find_tracking(&repository.clone_url, &branch)
            .await?;

        if services.is_empty() {
            tracing::debug!("No service tracks {}@{}", repository.full_name, branch);
        }

        let mut outcomes = Vec::with_capacity(services.len());
        for service in services {
            let trigger = Trigger {
                kind: TriggerKind::Webhook,
                provider: event.metadata.get(META_PROVIDER).cloned(),
                delivery_id: event.metadata.get(META_DELIVERY_ID).cloned(),
                commit_sha: commit_sha.clone(),
                branch: branch.clone(),
            };
            outcomes.push(self.accept_trigger(&service, trigger, Some(event)).await?);
        }

        Ok(outcomes)
    }

    /// Manually build and deploy a service at a commit
    pub async fn trigger(&self, service_id: Uuid, request: TriggerService) -> Result<TriggerOutcome> {
        let commit_sha = request.commit_sha.trim();
        if commit_sha.is_empty() {
            return Err(OrchestratorError::Validation(
                "commit_sha must not be empty".to_string(),
            ));
        }

        let service = self.load_service(service_id).await?;
        let branch = request
            .branch
            .filter(|branch| !branch.trim().is_empty())
            .unwrap_or_else(|| service.source.branch.clone());

        let trigger = Trigger {
            kind: TriggerKind::Manual,
            provider: None,
            delivery_id: None,
            commit_sha: commit_sha.to_string(),
            branch,
        };
        self.accept_trigger(&service, trigger, None).await
    }

    /// Create a workflow for `trigger`, or fold it into the active one for the
    /// same `(service, commit)` key
    async fn accept_trigger(
        &self,
        service: &Service,
        trigger: Trigger,
        cause: Option<&DomainEvent>,
    ) -> Result<TriggerOutcome> {
        if let Some(existing) = self
            .repos
            .workflows
            .find_active(service.id, &trigger.commit_sha)
            .await?
        {
            tracing::info!(
                "Coalescing trigger for {} at {} into workflow {}",
                service.slug,
                trigger.commit_sha,
                existing.id
            );
            return Ok(TriggerOutcome {
                workflow: existing,
                coalesced: true,
            });
        }

        let build = Build::queued(service.id, trigger.commit_sha.clone());
        let workflow = Workflow::pending(service.id, build.id, trigger);

        match self.repos.workflows.create_with_build(&workflow, &build).await {
            Ok(()) => {}
            Err(RepositoryError::Conflict(_)) => {
                // Another consumer inserted the same key after our lookup
                let existing = self
                    .repos
                    .workflows
                    .find_active(service.id, &workflow.trigger.commit_sha)
                    .await?
                    .ok_or_else(|| {
                        OrchestratorError::Conflict(format!(
                            "workflow for {} at {} changed concurrently",
                            service.slug, workflow.trigger.commit_sha
                        ))
                    })?;
                return Ok(TriggerOutcome {
                    workflow: existing,
                    coalesced: true,
                });
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(
            "Workflow {} created for {} at {} ({} trigger)",
            workflow.id,
            service.slug,
            workflow.trigger.commit_sha,
            workflow.trigger.kind
        );

        let workflow = self.start_build(workflow.id, cause).await?;
        Ok(TriggerOutcome {
            workflow,
            coalesced: false,
        })
    }

    // =========================================================================
    // Build stage
    // =========================================================================

    /// Move a pending workflow to `Building` and submit its build to CI
    pub async fn start_build(&self, workflow_id: Uuid, cause: Option<&DomainEvent>) -> Result<Workflow> {
        let now = Utc::now();
        let Some(workflow) = self
            .claim(
                workflow_id,
                |w| w.status == WorkflowStatus::Pending,
                |w| w.transition(WorkflowStatus::Building, now),
            )
            .await?
        else {
            return self.load_workflow(workflow_id).await;
        };

        let build_id = workflow.build_id;
        self.update_service(workflow.service_id, |s| {
            s.status = ServiceStatus::Building;
            s.current_build_id = Some(build_id);
        })
        .await?;

        self.submit_build(&workflow, cause).await?;
        self.load_workflow(workflow_id).await
    }

    /// Hand the workflow's build to CI.
    ///
    /// Also used to re-submit a build whose submission was interrupted; the
    /// build id doubles as the CI idempotency key.
    pub(crate) async fn submit_build(
        &self,
        workflow: &Workflow,
        cause: Option<&DomainEvent>,
    ) -> Result<()> {
        let service = self.load_service(workflow.service_id).await?;
        let mut build = self.load_build(workflow.build_id).await?;

        let (ci, service_ref, build_ref) = (&self.ci, &service, &build);
        let result = self
            .retry
            .run("trigger build", move || ci.trigger_build(service_ref, build_ref))
            .await;

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                self.fail_build(
                    build.id,
                    BuildStatus::Failed,
                    &format!("build trigger failed: {}", e),
                    cause,
                )
                .await?;
                return Ok(());
            }
        };

        build.external_id = Some(report.external_id.clone());
        build.started_at.get_or_insert_with(Utc::now);
        if build.status == BuildStatus::Queued && report.status != BuildStatus::Queued {
            build.status = BuildStatus::Running;
        }
        if !self.repos.builds.update(&build).await? {
            tracing::debug!("Build {} finished before its submission was recorded", build.id);
        }

        tracing::info!(
            "Build {} submitted to CI as {} for {}",
            build.id,
            report.external_id,
            service.slug
        );
        self.emit(
            self.event(types::BUILD_TRIGGERED, workflow, cause)
                .with_payload("external_id", &report.external_id),
        )
        .await;

        if report.status.is_terminal() {
            self.apply_build_report(build.id, &report, cause).await?;
        }
        Ok(())
    }

    /// Apply a CI status report to a build
    pub async fn apply_build_report(
        &self,
        build_id: Uuid,
        report: &BuildReport,
        cause: Option<&DomainEvent>,
    ) -> Result<()> {
        match report.status {
            BuildStatus::Queued => Ok(()),
            BuildStatus::Running => {
                let mut build = self.load_build(build_id).await?;
                if build.status == BuildStatus::Queued {
                    build.status = BuildStatus::Running;
                    if !self.repos.builds.update(&build).await? {
                        tracing::debug!("Build {} finished meanwhile; running report dropped", build_id);
                    }
                }
                Ok(())
            }
            BuildStatus::Succeeded => {
                self.complete_build(build_id, report.artifact.clone(), cause)
                    .await
            }
            BuildStatus::Failed | BuildStatus::Canceled => {
                let reason = report
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("build {}", report.status));
                self.fail_build(build_id, report.status, &reason, cause)
                    .await
                    .map(|_| ())
            }
        }
    }

    /// A build succeeded: record it, create the deployment, and hand it to GitOps.
    ///
    /// A no-op unless the owning workflow is still `Building`.
    pub async fn complete_build(
        &self,
        build_id: Uuid,
        artifact: Option<String>,
        cause: Option<&DomainEvent>,
    ) -> Result<()> {
        let workflow = self.workflow_for_build(build_id).await?;
        let now = Utc::now();

        let Some(workflow) = self
            .claim(
                workflow.id,
                |w| w.status == WorkflowStatus::Building,
                |w| w.transition(WorkflowStatus::Deploying, now),
            )
            .await?
        else {
            tracing::debug!("Build {} success ignored: workflow already past building", build_id);
            return Ok(());
        };

        let mut build = self.load_build(build_id).await?;
        if !build.status.is_terminal() {
            build.status = BuildStatus::Succeeded;
            build.artifact = artifact.or(build.artifact);
            build.finished_at = Some(now);
            self.repos.builds.update(&build).await?;
        }

        tracing::info!("Build {} succeeded for workflow {}", build_id, workflow.id);
        if is_echo(cause, types::BUILD_SUCCEEDED) {
            tracing::debug!("Not republishing {} for build {}", types::BUILD_SUCCEEDED, build_id);
        } else {
            self.emit(
                self.event(types::BUILD_SUCCEEDED, &workflow, cause)
                    .with_payload("artifact", &build.artifact),
            )
            .await;
        }

        self.deploy(workflow, cause).await
    }

    /// Record a terminal build failure.
    ///
    /// Returns the failed workflow, or `None` when it had already moved past
    /// the build stage. GitOps is never involved.
    pub async fn fail_build(
        &self,
        build_id: Uuid,
        status: BuildStatus,
        reason: &str,
        cause: Option<&DomainEvent>,
    ) -> Result<Option<Workflow>> {
        let workflow = self.workflow_for_build(build_id).await?;
        let now = Utc::now();

        let Some(workflow) = self
            .claim(
                workflow.id,
                |w| matches!(w.status, WorkflowStatus::Pending | WorkflowStatus::Building),
                |w| w.fail(reason, now),
            )
            .await?
        else {
            tracing::debug!("Build {} failure ignored: workflow already settled", build_id);
            return Ok(None);
        };

        self.record_failure(&workflow, Stage::Build(status), reason, cause)
            .await?;
        Ok(Some(workflow))
    }

    // =========================================================================
    // Deployment stage
    // =========================================================================

    /// Create the deployment for a `Deploying` workflow if it has none, then
    /// upsert and sync the GitOps application.
    pub(crate) async fn deploy(&self, workflow: Workflow, cause: Option<&DomainEvent>) -> Result<()> {
        let service = self.load_service(workflow.service_id).await?;
        let build = self.load_build(workflow.build_id).await?;
        if build.status != BuildStatus::Succeeded {
            return Err(OrchestratorError::Conflict(format!(
                "build {} is {}; only succeeded builds can be deployed",
                build.id, build.status
            )));
        }

        let mut deployment = match workflow.deployment_id {
            Some(id) => self.load_deployment(id).await?,
            None => match self.create_deployment(&workflow, &build, cause).await? {
                Some(created) => created,
                None => return Ok(()),
            },
        };

        if deployment.external_id.is_some() || deployment.status.is_terminal() {
            return Ok(());
        }

        let environment = Environment {
            namespace: self.namespace.clone(),
            image: deployment.version.clone(),
            revision: build.commit_sha.clone(),
        };

        let gitops = &self.gitops;
        let (service_ref, environment_ref) = (&service, &environment);
        let result = async {
            let external_id = self
                .retry
                .run("create application", move || {
                    gitops.create_or_update_application(service_ref, environment_ref)
                })
                .await?;
            let id_ref = external_id.as_str();
            self.retry
                .run("sync application", move || gitops.sync_application(id_ref))
                .await?;
            Ok::<_, PortError>(external_id)
        }
        .await;

        match result {
            Ok(external_id) => {
                tracing::info!(
                    "Deployment {} of {} syncing as {}",
                    deployment.id,
                    service.slug,
                    external_id
                );
                deployment.external_id = Some(external_id);
                deployment.status = DeploymentStatus::InProgress;
                if !self.repos.deployments.update(&deployment).await? {
                    tracing::debug!("Deployment {} settled while syncing", deployment.id);
                }
                Ok(())
            }
            Err(e) => {
                self.fail_deployment(deployment.id, &format!("deployment failed: {}", e), cause)
                    .await?;
                Ok(())
            }
        }
    }

    async fn create_deployment(
        &self,
        workflow: &Workflow,
        build: &Build,
        cause: Option<&DomainEvent>,
    ) -> Result<Option<Deployment>> {
        let now = Utc::now();
        let mut deployment = Deployment {
            id: Uuid::new_v4(),
            service_id: workflow.service_id,
            build_id: build.id,
            status: DeploymentStatus::Pending,
            external_id: None,
            revision: Some(build.commit_sha.clone()),
            version: build
                .artifact
                .clone()
                .unwrap_or_else(|| build.commit_sha.clone()),
            replicas: 1,
            error: None,
            created_at: now,
            finished_at: None,
        };
        self.repos.deployments.create(&deployment).await?;

        let deployment_id = deployment.id;
        let Some(workflow) = self
            .claim(
                workflow.id,
                |w| w.status == WorkflowStatus::Deploying && w.deployment_id.is_none(),
                |w| {
                    w.deployment_id = Some(deployment_id);
                    w.updated_at = now;
                    w.last_activity_at = now;
                    Ok(())
                },
            )
            .await?
        else {
            // The workflow settled or got a deployment meanwhile
            deployment.status = DeploymentStatus::Failed;
            deployment.error = Some("superseded".to_string());
            deployment.finished_at = Some(now);
            self.repos.deployments.update(&deployment).await?;
            return Ok(None);
        };

        self.update_service(workflow.service_id, |s| {
            s.status = ServiceStatus::Deploying;
        })
        .await?;

        tracing::info!(
            "Deployment {} created for workflow {} (version {})",
            deployment.id,
            workflow.id,
            deployment.version
        );
        self.emit(
            self.event(types::DEPLOYMENT_STARTED, &workflow, cause)
                .with_payload("version", &deployment.version),
        )
        .await;

        Ok(Some(deployment))
    }

    /// Apply a GitOps status report to a deployment
    pub async fn apply_application_status(
        &self,
        deployment_id: Uuid,
        status: &ApplicationStatus,
    ) -> Result<()> {
        match status.outcome() {
            RolloutOutcome::InProgress => Ok(()),
            RolloutOutcome::Succeeded => {
                self.complete_deployment(deployment_id, status.revision.clone())
                    .await
            }
            RolloutOutcome::Failed => {
                let detail = status
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("health {:?}", status.health));
                self.fail_deployment(
                    deployment_id,
                    &format!("deployment unhealthy: {}", detail),
                    None,
                )
                .await
            }
        }
    }

    async fn complete_deployment(&self, deployment_id: Uuid, revision: Option<String>) -> Result<()> {
        let mut deployment = self.load_deployment(deployment_id).await?;
        let workflow = self.workflow_for_build(deployment.build_id).await?;
        let now = Utc::now();

        let Some(workflow) = self
            .claim(
                workflow.id,
                |w| w.status == WorkflowStatus::Deploying && w.deployment_id == Some(deployment_id),
                |w| w.transition(WorkflowStatus::Succeeded, now),
            )
            .await?
        else {
            tracing::debug!("Deployment {} success ignored: workflow already settled", deployment_id);
            return Ok(());
        };

        deployment.status = DeploymentStatus::Succeeded;
        deployment.revision = revision.or(deployment.revision);
        deployment.finished_at = Some(now);
        self.repos.deployments.update(&deployment).await?;

        self.update_service(workflow.service_id, |s| {
            s.status = ServiceStatus::Running;
            s.current_build_id = Some(deployment.build_id);
            s.current_deployment_id = Some(deployment.id);
            s.current_version = Some(deployment.version.clone());
        })
        .await?;

        tracing::info!(
            "Workflow {} succeeded: version {} is live",
            workflow.id,
            deployment.version
        );
        self.emit(
            self.event(types::DEPLOYMENT_SUCCEEDED, &workflow, None)
                .with_payload("version", &deployment.version),
        )
        .await;
        Ok(())
    }

    pub(crate) async fn fail_deployment(
        &self,
        deployment_id: Uuid,
        reason: &str,
        cause: Option<&DomainEvent>,
    ) -> Result<()> {
        let deployment = self.load_deployment(deployment_id).await?;
        let workflow = self.workflow_for_build(deployment.build_id).await?;
        let now = Utc::now();

        let Some(workflow) = self
            .claim(
                workflow.id,
                |w| w.status == WorkflowStatus::Deploying,
                |w| w.fail(reason, now),
            )
            .await?
        else {
            tracing::debug!("Deployment {} failure ignored: workflow already settled", deployment_id);
            return Ok(());
        };

        self.record_failure(&workflow, Stage::Deployment, reason, cause)
            .await
    }

    // =========================================================================
    // Operator actions
    // =========================================================================

    /// Cancel a pending or building workflow
    pub async fn cancel(&self, workflow_id: Uuid) -> Result<Workflow> {
        let workflow = self.load_workflow(workflow_id).await?;
        if !matches!(
            workflow.status,
            WorkflowStatus::Pending | WorkflowStatus::Building
        ) {
            return Err(OrchestratorError::Conflict(format!(
                "workflow {} is {}; only pending or building workflows can be canceled",
                workflow_id, workflow.status
            )));
        }

        let build = self.load_build(workflow.build_id).await?;
        if let Some(external_id) = build.external_id.as_deref() {
            let ci = &self.ci;
            self.retry
                .run("cancel build", move || ci.cancel_build(external_id))
                .await?;
        }

        let workflow = self
            .fail_build(build.id, BuildStatus::Canceled, CANCELED_REASON, None)
            .await?
            .ok_or_else(|| {
                OrchestratorError::Conflict(format!(
                    "workflow {} finished before it could be canceled",
                    workflow_id
                ))
            })?;

        tracing::info!("Workflow {} canceled", workflow_id);
        Ok(workflow)
    }

    /// Roll a succeeded workflow back to the service's previous successful deployment
    pub async fn rollback(&self, workflow_id: Uuid) -> Result<Workflow> {
        let workflow = self.load_workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Succeeded {
            return Err(OrchestratorError::Conflict(format!(
                "workflow {} is {}; only succeeded workflows can be rolled back",
                workflow_id, workflow.status
            )));
        }

        let deployment_id = workflow.deployment_id.ok_or_else(|| {
            OrchestratorError::Conflict(format!("workflow {} has no deployment", workflow_id))
        })?;
        let mut deployment = self.load_deployment(deployment_id).await?;
        let external_id = deployment.external_id.clone().ok_or_else(|| {
            OrchestratorError::Conflict(format!(
                "deployment {} was never synced",
                deployment_id
            ))
        })?;

        let previous = self
            .repos
            .deployments
            .find_previous_succeeded(workflow.service_id, deployment.created_at)
            .await?
            .ok_or_else(|| {
                OrchestratorError::Conflict(format!(
                    "no earlier successful deployment to roll back to from {}",
                    deployment_id
                ))
            })?;
        let revision = previous
            .revision
            .clone()
            .unwrap_or_else(|| previous.version.clone());

        // Claimed before GitOps is touched so concurrent requests roll back once
        let now = Utc::now();
        let workflow = self
            .claim(
                workflow_id,
                |w| w.status == WorkflowStatus::Succeeded,
                |w| w.transition(WorkflowStatus::RolledBack, now),
            )
            .await?
            .ok_or_else(|| {
                OrchestratorError::Conflict(format!(
                    "workflow {} was rolled back concurrently",
                    workflow_id
                ))
            })?;

        let (gitops, id_ref, revision_ref) = (&self.gitops, external_id.as_str(), revision.as_str());
        if let Err(e) = self
            .retry
            .run("rollback application", move || gitops.rollback(id_ref, revision_ref))
            .await
        {
            let reason = format!("rollback failed: {}", e);
            self.record_rollback_failure(&workflow, &reason).await?;
            return Err(e.into());
        }

        deployment.status = DeploymentStatus::RolledBack;
        if !self.repos.deployments.update(&deployment).await? {
            tracing::warn!("Deployment {} was no longer live when rolled back", deployment_id);
        }

        self.update_service(workflow.service_id, |s| {
            s.status = ServiceStatus::Running;
            s.current_build_id = Some(previous.build_id);
            s.current_deployment_id = Some(previous.id);
            s.current_version = Some(previous.version.clone());
        })
        .await?;

        tracing::info!(
            "Workflow {} rolled back to deployment {} (version {})",
            workflow_id,
            previous.id,
            previous.version
        );
        self.emit(
            self.event(types::DEPLOYMENT_ROLLED_BACK, &workflow, None)
                .with_payload("rolled_back_to", previous.id)
                .with_payload("version", &previous.version)
                .with_payload("revision", &revision),
        )
        .await;

        Ok(workflow)
    }

    /// The rolled-back workflow keeps its status; the error records that the
    /// current deployment is still live.
    async fn record_rollback_failure(&self, workflow: &Workflow, reason: &str) -> Result<()> {
        let now = Utc::now();
        let recorded = self
            .claim(
                workflow.id,
                |w| w.status == WorkflowStatus::RolledBack,
                |w| {
                    w.error = Some(reason.to_string());
                    w.updated_at = now;
                    w.last_activity_at = now;
                    Ok(())
                },
            )
            .await?
            .unwrap_or_else(|| workflow.clone());

        tracing::error!("Workflow {}: {}", workflow.id, reason);
        self.emit(
            self.event(types::DEPLOYMENT_FAILED, &recorded, None)
                .with_payload("stage", "rollback")
                .with_payload("error", reason),
        )
        .await;
        Ok(())
    }

    /// Force-fail an active workflow that has had no activity since `cutoff`.
    ///
    /// Returns `false` when the workflow settled or saw activity in the meantime.
    pub async fn expire(&self, workflow_id: Uuid, cutoff: DateTime<Utc>, reason: &str) -> Result<bool> {
        let now = Utc::now();
        let mut previous = WorkflowStatus::Pending;

        let Some(workflow) = self
            .claim(
                workflow_id,
                |w| w.status.is_active() && w.last_activity_at < cutoff,
                |w| {
                    previous = w.status;
                    w.fail(reason, now)
                },
            )
            .await?
        else {
            return Ok(false);
        };

        let stage = if previous == WorkflowStatus::Deploying {
            Stage::Deployment
        } else {
            let build = self.load_build(workflow.build_id).await?;
            if let (Some(external_id), false) = (build.external_id.as_deref(), build.status.is_terminal())
                && let Err(e) = self.ci.cancel_build(external_id).await
            {
                tracing::warn!("Failed to cancel expired build {}: {}", build.id, e);
            }
            Stage::Build(BuildStatus::Failed)
        };

        tracing::warn!("Workflow {} expired while {}", workflow_id, previous);
        self.record_failure(&workflow, stage, reason, None).await?;
        Ok(true)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_workflow(&self, id: Uuid) -> Result<WorkflowDetails> {
        let workflow = self.load_workflow(id).await?;
        let build = self.repos.builds.find_by_id(workflow.build_id).await?;
        let deployment = match workflow.deployment_id {
            Some(deployment_id) => self.repos.deployments.find_by_id(deployment_id).await?,
            None => None,
        };

        Ok(WorkflowDetails {
            workflow,
            build,
            deployment,
        })
    }

    pub async fn list_workflows(&self, query: &WorkflowQuery) -> Result<Vec<Workflow>> {
        Ok(self.repos.workflows.list(query).await?)
    }

    pub async fn build_logs(&self, build_id: Uuid) -> Result<LogStream> {
        let build = self.load_build(build_id).await?;
        let external_id = build.external_id.ok_or_else(|| {
            OrchestratorError::Conflict(format!("build {} has not been submitted to CI", build_id))
        })?;

        let (ci, id_ref) = (&self.ci, external_id.as_str());
        Ok(self
            .retry
            .run("fetch build logs", move || ci.get_build_logs(id_ref))
            .await?)
    }

    // =========================================================================
    // Helper Functions
    // =========================================================================

    /// Apply `change` to the stored workflow if it satisfies `precondition`.
    ///
    /// A lost compare-and-swap reloads and re-checks instead of overwriting,
    /// so the change lands on the latest state or not at all. `None` means the
    /// precondition no longer holds.
    pub(crate) async fn claim<P, F>(
        &self,
        workflow_id: Uuid,
        precondition: P,
        mut change: F,
    ) -> Result<Option<Workflow>>
    where
        P: Fn(&Workflow) -> bool,
        F: FnMut(&mut Workflow) -> std::result::Result<(), InvalidTransition>,
    {
        for _ in 0..MAX_CLAIM_ATTEMPTS {
            let mut workflow = self.load_workflow(workflow_id).await?;
            if !precondition(&workflow) {
                return Ok(None);
            }

            change(&mut workflow)?;
            if self.repos.workflows.update(&mut workflow).await? {
                return Ok(Some(workflow));
            }
            tracing::debug!("Lost update race on workflow {}, reloading", workflow_id);
        }

        Err(OrchestratorError::Conflict(format!(
            "workflow {} is contended",
            workflow_id
        )))
    }

    /// Mark the failed stage's entity, update the service and publish the failure
    async fn record_failure(
        &self,
        workflow: &Workflow,
        stage: Stage,
        reason: &str,
        cause: Option<&DomainEvent>,
    ) -> Result<()> {
        let now = Utc::now();

        let event = match stage {
            Stage::Build(status) => {
                let mut build = self.load_build(workflow.build_id).await?;
                if !build.status.is_terminal() {
                    build.status = status;
                    build.error = Some(reason.to_string());
                    build.finished_at = Some(now);
                    self.repos.builds.update(&build).await?;
                }
                self.event(types::BUILD_FAILED, workflow, cause)
                    .with_payload("status", build.status)
            }
            Stage::Deployment => {
                if let Some(deployment_id) = workflow.deployment_id {
                    let mut deployment = self.load_deployment(deployment_id).await?;
                    if !deployment.status.is_terminal() {
                        deployment.status = DeploymentStatus::Failed;
                        deployment.error = Some(reason.to_string());
                        deployment.finished_at = Some(now);
                        self.repos.deployments.update(&deployment).await?;
                    }
                }
                self.event(types::DEPLOYMENT_FAILED, workflow, cause)
            }
        };

        let canceled = matches!(stage, Stage::Build(BuildStatus::Canceled));
        let build_id = workflow.build_id;
        self.update_service(workflow.service_id, |s| {
            // A newer workflow owns the service status
            if s.current_build_id != Some(build_id) {
                return;
            }
            s.status = match (canceled, s.current_deployment_id) {
                (false, _) => ServiceStatus::Failed,
                (true, Some(_)) => ServiceStatus::Running,
                (true, None) => ServiceStatus::Pending,
            };
        })
        .await?;

        tracing::warn!("Workflow {} failed: {}", workflow.id, reason);
        if is_echo(cause, &event.event_type) {
            return Ok(());
        }
        self.emit(event.with_payload("error", reason)).await;
        Ok(())
    }

    fn event(&self, event_type: &str, workflow: &Workflow, cause: Option<&DomainEvent>) -> DomainEvent {
        let mut event = DomainEvent::new(event_type, SOURCE, workflow.service_id.to_string())
            .with_correlation(workflow.id)
            .with_payload("workflow_id", workflow.id)
            .with_payload("service_id", workflow.service_id)
            .with_payload("build_id", workflow.build_id)
            .with_payload("commit_sha", &workflow.trigger.commit_sha);

        if let Some(deployment_id) = workflow.deployment_id {
            event = event.with_payload("deployment_id", deployment_id);
        }
        if let Some(delivery_id) = &workflow.trigger.delivery_id {
            event = event.with_metadata(META_DELIVERY_ID, delivery_id.clone());
        }
        event.causation_id = cause.map(|c| c.id);
        event
    }

    /// Publish after state is persisted; a failed publish is logged, not undone
    async fn emit(&self, event: DomainEvent) {
        let subject = event.bus_subject();
        if let Err(e) = self.bus.publish(&subject, event).await {
            tracing::error!("Failed to publish {}: {}", subject, e);
        }
    }

    async fn update_service(&self, service_id: Uuid, apply: impl FnOnce(&mut Service)) -> Result<()> {
        let mut service = self.load_service(service_id).await?;
        apply(&mut service);
        service.updated_at = Utc::now();
        self.repos.services.update(&service).await?;
        Ok(())
    }

    async fn load_workflow(&self, id: Uuid) -> Result<Workflow> {
        self.repos
            .workflows
            .find_by_id(id)
            .await?
            .ok_or(OrchestratorError::NotFound {
                entity: "workflow",
                id,
            })
    }

    async fn workflow_for_build(&self, build_id: Uuid) -> Result<Workflow> {
        self.repos
            .workflows
            .find_by_build(build_id)
            .await?
            .ok_or(OrchestratorError::NotFound {
                entity: "workflow for build",
                id: build_id,
            })
    }

    async fn load_service(&self, id: Uuid) -> Result<Service> {
        self.repos
            .services
            .find_by_id(id)
            .await?
            .ok_or(OrchestratorError::NotFound {
                entity: "service",
                id,
            })
    }

    async fn load_build(&self, id: Uuid) -> Result<Build> {
        self.repos
            .builds
            .find_by_id(id)
            .await?
            .ok_or(OrchestratorError::NotFound { entity: "build", id })
    }

    async fn load_deployment(&self, id: Uuid) -> Result<Deployment> {
        self.repos
            .deployments
            .find_by_id(id)
            .await?
            .ok_or(OrchestratorError::NotFound {
                entity: "deployment",
                id,
            })
    }
}

/// True when `cause` is itself the event we would publish
fn is_echo(cause: Option<&DomainEvent>, event_type: &str) -> bool {
    cause.is_some_and(|c| c.event_type == event_type)
}
