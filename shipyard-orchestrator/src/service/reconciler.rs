//! Reconciler
//!
//! Periodically polls CI for every building workflow and GitOps for every
//! deploying one, feeding the reports into the state machine. It also picks up
//! work a crashed process left behind: pending workflows that were never
//! submitted and deploying workflows that never reached GitOps.

use chrono::Utc;
use shipyard_core::domain::build::BuildStatus;
use shipyard_core::domain::workflow::{Workflow, WorkflowStatus};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

use super::orchestrator::{Orchestrator, Result};

pub struct Reconciler {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Tick until `shutdown` fires
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("Starting reconciler (interval: {:?})", self.interval);

        let mut interval = time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Reconciler shutting down");
                    break;
                }
                _ = interval.tick() => {
                    match self.reconcile_once().await {
                        Ok(changed) if changed > 0 => {
                            info!("Reconciled {} workflow(s) this cycle", changed)
                        }
                        Ok(_) => {}
                        Err(e) => error!("Error during reconcile cycle: {}", e),
                    }
                }
            }
        }
    }

    /// Poll every active workflow once; returns how many changed status
    pub async fn reconcile_once(&self) -> Result<usize> {
        let repos = self.orchestrator.repositories();
        let workflows = repos.workflows.list_by_status(&WorkflowStatus::ACTIVE).await?;

        if workflows.is_empty() {
            debug!("No active workflows");
            return Ok(0);
        }

        let mut changed = 0;
        for workflow in workflows {
            if let Err(e) = self.reconcile(&workflow).await {
                error!("Failed to reconcile workflow {}: {}", workflow.id, e);
                continue;
            }

            let after = repos.workflows.find_by_id(workflow.id).await?;
            if after.is_none_or(|w| w.status != workflow.status) {
                changed += 1;
            }
        }

        Ok(changed)
    }

    async fn reconcile(&self, workflow: &Workflow) -> Result<()> {
        match workflow.status {
            WorkflowStatus::Pending => {
                if self.is_abandoned(workflow) {
                    info!("Resuming pending workflow {}", workflow.id);
                    self.orchestrator.start_build(workflow.id, None).await?;
                }
                Ok(())
            }
            WorkflowStatus::Building => self.poll_build(workflow).await,
            WorkflowStatus::Deploying => self.poll_deployment(workflow).await,
            _ => Ok(()),
        }
    }

    async fn poll_build(&self, workflow: &Workflow) -> Result<()> {
        let repos = self.orchestrator.repositories();
        let Some(build) = repos.builds.find_by_id(workflow.build_id).await? else {
            return Ok(());
        };

        let Some(external_id) = build.external_id.as_deref() else {
            if self.is_abandoned(workflow) {
                info!("Resubmitting build {} of workflow {}", build.id, workflow.id);
                self.orchestrator.submit_build(workflow, None).await?;
            }
            return Ok(());
        };

        let ci = self.orchestrator.ci();
        let report = self
            .orchestrator
            .retry_policy()
            .run("get build status", move || ci.get_build_status(external_id))
            .await;

        match report {
            Ok(report) => {
                self.orchestrator
                    .apply_build_report(build.id, &report, None)
                    .await
            }
            Err(e) => {
                self.orchestrator
                    .fail_build(
                        build.id,
                        BuildStatus::Failed,
                        &format!("build status unavailable: {}", e),
                        None,
                    )
                    .await?;
                Ok(())
            }
        }
    }

    async fn poll_deployment(&self, workflow: &Workflow) -> Result<()> {
        let repos = self.orchestrator.repositories();
        let deployment = match workflow.deployment_id {
            Some(id) => repos.deployments.find_by_id(id).await?,
            None => None,
        };

        let Some((deployment_id, external_id)) = deployment
            .as_ref()
            .and_then(|d| d.external_id.as_deref().map(|ext| (d.id, ext)))
        else {
            if self.is_abandoned(workflow) {
                info!("Resuming deployment of workflow {}", workflow.id);
                self.orchestrator.deploy(workflow.clone(), None).await?;
            }
            return Ok(());
        };

        let gitops = self.orchestrator.gitops();
        let status = self
            .orchestrator
            .retry_policy()
            .run("get application status", move || {
                gitops.get_application_status(external_id)
            })
            .await;

        match status {
            Ok(status) => {
                self.orchestrator
                    .apply_application_status(deployment_id, &status)
                    .await
            }
            Err(e) => {
                self.orchestrator
                    .fail_deployment(
                        deployment_id,
                        &format!("deployment status unavailable: {}", e),
                        None,
                    )
                    .await
            }
        }
    }

    /// No live call can still be acting on the workflow
    fn is_abandoned(&self, workflow: &Workflow) -> bool {
        let grace = self.orchestrator.retry_policy().worst_case();
        let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::days(365));
        Utc::now() - workflow.last_activity_at > grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{HealthStatus, SyncStatus};
    use crate::testing::Harness;
    use shipyard_core::domain::build::Build;
    use shipyard_core::domain::deployment::DeploymentStatus;
    use shipyard_core::domain::workflow::{Trigger, TriggerKind};
    use shipyard_core::dto::workflow::TriggerService;

    fn reconciler(h: &Harness) -> Reconciler {
        Reconciler::new(h.orchestrator.clone(), Duration::from_millis(10))
    }

    async fn trigger(h: &Harness, sha: &str) -> Workflow {
        h.orchestrator
            .trigger(
                h.service.id,
                TriggerService {
                    commit_sha: sha.to_string(),
                    branch: None,
                },
            )
            .await
            .unwrap()
            .workflow
    }

    async fn status(h: &Harness, workflow: &Workflow) -> WorkflowStatus {
        h.repos
            .workflows
            .find_by_id(workflow.id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn test_polls_workflow_to_success() {
        let h = Harness::new().await;
        let reconciler = reconciler(&h);
        let workflow = trigger(&h, "abc123").await;

        // CI still running
        assert_eq!(reconciler.reconcile_once().await.unwrap(), 0);
        assert_eq!(status(&h, &workflow).await, WorkflowStatus::Building);

        h.ci.finish(workflow.build_id, BuildStatus::Succeeded, Some("img:abc123"))
            .await;
        assert_eq!(reconciler.reconcile_once().await.unwrap(), 1);
        assert_eq!(status(&h, &workflow).await, WorkflowStatus::Deploying);
        assert_eq!(h.gitops.synced().await, vec!["billing-api"]);

        // Still progressing
        assert_eq!(reconciler.reconcile_once().await.unwrap(), 0);

        h.gitops
            .set_status("billing-api", HealthStatus::Healthy, SyncStatus::Synced)
            .await;
        assert_eq!(reconciler.reconcile_once().await.unwrap(), 1);
        assert_eq!(status(&h, &workflow).await, WorkflowStatus::Succeeded);

        // Nothing left to poll; the finished build is not re-applied
        assert_eq!(reconciler.reconcile_once().await.unwrap(), 0);
        assert_eq!(h.gitops.synced().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_build_is_not_deployed() {
        let h = Harness::new().await;
        let workflow = trigger(&h, "abc123").await;

        h.ci.finish(workflow.build_id, BuildStatus::Failed, None).await;
        reconciler(&h).reconcile_once().await.unwrap();

        let details = h.orchestrator.get_workflow(workflow.id).await.unwrap();
        assert_eq!(details.workflow.status, WorkflowStatus::Failed);
        assert_eq!(details.workflow.error.as_deref(), Some("exit status 1"));
        assert!(h.gitops.synced().await.is_empty());
    }

    #[tokio::test]
    async fn test_degraded_application_fails_deployment() {
        let h = Harness::new().await;
        let reconciler = reconciler(&h);
        let workflow = trigger(&h, "abc123").await;

        h.ci.finish(workflow.build_id, BuildStatus::Succeeded, Some("img:abc123"))
            .await;
        reconciler.reconcile_once().await.unwrap();
        h.gitops
            .set_status("billing-api", HealthStatus::Degraded, SyncStatus::Synced)
            .await;
        reconciler.reconcile_once().await.unwrap();

        let details = h.orchestrator.get_workflow(workflow.id).await.unwrap();
        assert_eq!(details.workflow.status, WorkflowStatus::Failed);
        assert_eq!(details.deployment.unwrap().status, DeploymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_unreachable_ci_fails_build() {
        let h = Harness::new().await;
        let workflow = trigger(&h, "abc123").await;

        // The fake has no report for an unknown id
        h.ci.state.lock().await.reports.clear();
        reconciler(&h).reconcile_once().await.unwrap();

        let details = h.orchestrator.get_workflow(workflow.id).await.unwrap();
        assert_eq!(details.workflow.status, WorkflowStatus::Failed);
        let error = details.workflow.error.unwrap();
        assert!(error.starts_with("build status unavailable"), "{error}");
    }

    #[tokio::test]
    async fn test_resumes_abandoned_pending_workflow() {
        let h = Harness::new().await;
        let trigger = |sha: &str| Trigger {
            kind: TriggerKind::Manual,
            provider: None,
            delivery_id: None,
            commit_sha: sha.to_string(),
            branch: "main".to_string(),
        };

        let abandoned_build = Build::queued(h.service.id, "aaa111");
        let mut abandoned = Workflow::pending(h.service.id, abandoned_build.id, trigger("aaa111"));
        abandoned.last_activity_at = Utc::now() - chrono::Duration::hours(1);
        h.repos
            .workflows
            .create_with_build(&abandoned, &abandoned_build)
            .await
            .unwrap();

        let fresh_build = Build::queued(h.service.id, "bbb222");
        let fresh = Workflow::pending(h.service.id, fresh_build.id, trigger("bbb222"));
        h.repos
            .workflows
            .create_with_build(&fresh, &fresh_build)
            .await
            .unwrap();

        assert_eq!(reconciler(&h).reconcile_once().await.unwrap(), 1);
        assert_eq!(status(&h, &abandoned).await, WorkflowStatus::Building);
        assert_eq!(status(&h, &fresh).await, WorkflowStatus::Pending);
        assert_eq!(h.ci.triggered().await, vec![abandoned_build.id]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = Harness::new().await;
        let (shutdown, rx) = broadcast::channel(1);
        let handle = tokio::spawn(reconciler(&h).run(rx));

        shutdown.send(()).unwrap();
        time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
