//! Event bus consumers of the state machine

use async_trait::async_trait;
use shipyard_core::domain::build::BuildStatus;
use shipyard_core::domain::event::{DomainEvent, types};
use std::sync::Arc;
use uuid::Uuid;

use super::orchestrator::{self, Orchestrator, OrchestratorError};
use crate::bus::{BusError, EventBus, EventHandler, SubscriptionId, handler_fn};

/// Queue group shared by every orchestrator worker
pub const QUEUE_GROUP: &str = "orchestrator";

/// Subjects the state machine consumes. Build results arrive either bare or
/// scoped to a service slug.
pub const SUBJECTS: [&str; 5] = [
    "webhook.received",
    "build.succeeded",
    "build.succeeded.*",
    "build.failed",
    "build.failed.*",
];

/// Subscribe `workers` members of the orchestrator queue group to every
/// consumed subject, plus an audit logger that sees all traffic
pub async fn register(
    bus: &Arc<dyn EventBus>,
    orchestrator: Arc<Orchestrator>,
    workers: usize,
) -> Result<Vec<SubscriptionId>, BusError> {
    let handler: Arc<dyn EventHandler> = Arc::new(WorkflowSubscriber { orchestrator });
    let mut subscriptions = Vec::new();

    for subject in SUBJECTS {
        for _ in 0..workers.max(1) {
            subscriptions.push(
                bus.queue_subscribe(subject, QUEUE_GROUP, handler.clone())
                    .await?,
            );
        }
    }

    let audit = handler_fn(|subject: String, event: DomainEvent| async move {
        tracing::info!(
            "event {} on {} from {} (correlation {:?})",
            event.event_type,
            subject,
            event.source,
            event.correlation_id
        );
        Ok(None)
    });
    subscriptions.push(bus.subscribe(">", audit).await?);

    tracing::info!(
        "Orchestrator subscribed to {} subject(s) with {} worker(s)",
        SUBJECTS.len(),
        workers.max(1)
    );
    Ok(subscriptions)
}

/// Routes consumed events into the state machine
pub struct WorkflowSubscriber {
    orchestrator: Arc<Orchestrator>,
}

impl WorkflowSubscriber {
    async fn dispatch(&self, event: &DomainEvent) -> orchestrator::Result<()> {
        match event.event_type.as_str() {
            types::WEBHOOK_RECEIVED => {
                self.orchestrator.handle_webhook(event).await?;
                Ok(())
            }
            // Our own announcements come back through the wildcard
            types::BUILD_SUCCEEDED | types::BUILD_FAILED if event.source == orchestrator::SOURCE => {
                Ok(())
            }
            types::BUILD_SUCCEEDED => {
                let build_id = build_id(event)?;
                let artifact = event.payload_field::<String>("artifact");
                self.orchestrator
                    .complete_build(build_id, artifact, Some(event))
                    .await
            }
            types::BUILD_FAILED => {
                let build_id = build_id(event)?;
                let status = match event.payload_field::<BuildStatus>("status") {
                    Some(BuildStatus::Canceled) => BuildStatus::Canceled,
                    _ => BuildStatus::Failed,
                };
                let reason = event
                    .payload_field::<String>("error")
                    .unwrap_or_else(|| format!("build {}", status));
                self.orchestrator
                    .fail_build(build_id, status, &reason, Some(event))
                    .await?;
                Ok(())
            }
            other => {
                tracing::debug!("Orchestrator ignoring {} event", other);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl EventHandler for WorkflowSubscriber {
    async fn handle(
        &self,
        subject: &str,
        event: DomainEvent,
    ) -> Result<Option<DomainEvent>, BusError> {
        match self.dispatch(&event).await {
            Ok(()) => Ok(None),
            Err(e) if e.is_transient() => {
                tracing::warn!("Event {} on {} will be redelivered: {}", event.id, subject, e);
                Err(BusError::Handler(e.to_string()))
            }
            Err(e) => {
                tracing::warn!("Dropping event {} on {}: {}", event.id, subject, e);
                Ok(None)
            }
        }
    }
}

fn build_id(event: &DomainEvent) -> orchestrator::Result<Uuid> {
    event.payload_field("build_id").ok_or_else(|| {
        OrchestratorError::Validation(format!("event {} has no build_id", event.id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway;
    use crate::testing::{Harness, eventually, github_push, REPOSITORY_URL};
    use shipyard_core::domain::event::META_DELIVERY_ID;
    use shipyard_core::domain::workflow::WorkflowStatus;
    use shipyard_core::dto::workflow::WorkflowQuery;
    use shipyard_providers::{GitHubProvider, GitProvider};

    async fn subscribed() -> Harness {
        let h = Harness::new().await;
        let bus: Arc<dyn EventBus> = h.bus.clone();
        register(&bus, h.orchestrator.clone(), 2).await.unwrap();
        h
    }

    fn webhook_event(sha: &str) -> DomainEvent {
        let body = github_push(sha);
        let git_event = GitHubProvider::new(Default::default())
            .parse_webhook_event("push", body.as_bytes())
            .unwrap();
        assert_eq!(&git_event.repository().clone_url, REPOSITORY_URL);

        DomainEvent::new(types::WEBHOOK_RECEIVED, gateway::SOURCE, "acme/billing-api")
            .with_payload("event", &git_event)
            .with_metadata(META_DELIVERY_ID, format!("d-{}", sha))
    }

    async fn workflows(h: &Harness) -> Vec<shipyard_core::domain::workflow::Workflow> {
        h.orchestrator
            .list_workflows(&WorkflowQuery::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_webhook_event_starts_workflow() {
        let h = subscribed().await;

        h.bus
            .publish(types::WEBHOOK_RECEIVED, webhook_event("abc123"))
            .await
            .unwrap();
        // A redelivered copy coalesces
        h.bus
            .publish(types::WEBHOOK_RECEIVED, webhook_event("abc123"))
            .await
            .unwrap();

        eventually(|| async { h.ci.triggered().await.len() == 1 }).await;
        let workflows = workflows(&h).await;
        assert_eq!(workflows.len(), 1);
        assert_eq!(workflows[0].status, WorkflowStatus::Building);
    }

    #[tokio::test]
    async fn test_external_build_events_drive_workflow() {
        let h = subscribed().await;
        h.bus
            .publish(types::WEBHOOK_RECEIVED, webhook_event("abc123"))
            .await
            .unwrap();
        eventually(|| async { h.ci.triggered().await.len() == 1 }).await;
        let workflow = workflows(&h).await.remove(0);

        let succeeded = DomainEvent::new(types::BUILD_SUCCEEDED, "ci", "billing-api")
            .with_payload("build_id", workflow.build_id)
            .with_payload("artifact", "img:abc123");
        let subject = succeeded.bus_subject();
        h.bus.publish(&subject, succeeded.clone()).await.unwrap();
        h.bus.publish(&subject, succeeded).await.unwrap();

        eventually(|| async { !h.gitops.synced().await.is_empty() }).await;
        let details = h.orchestrator.get_workflow(workflow.id).await.unwrap();
        assert_eq!(details.workflow.status, WorkflowStatus::Deploying);
        assert_eq!(details.deployment.unwrap().version, "img:abc123");

        // Late failure for the same build is a no-op
        let failed = DomainEvent::new(types::BUILD_FAILED, "ci", "billing-api")
            .with_payload("build_id", workflow.build_id);
        h.bus.publish(&failed.bus_subject(), failed).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(h.gitops.synced().await.len(), 1);
        let workflow = h.repos.workflows.find_by_id(workflow.id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Deploying);
    }

    #[tokio::test]
    async fn test_unscoped_build_result_is_consumed() {
        let h = subscribed().await;
        h.bus
            .publish(types::WEBHOOK_RECEIVED, webhook_event("abc123"))
            .await
            .unwrap();
        eventually(|| async { h.ci.triggered().await.len() == 1 }).await;
        let workflow = workflows(&h).await.remove(0);

        let succeeded = DomainEvent::new(types::BUILD_SUCCEEDED, "ci", "")
            .with_payload("build_id", workflow.build_id)
            .with_payload("artifact", "img:abc123");
        assert_eq!(succeeded.bus_subject(), "build.succeeded");
        h.bus.publish("build.succeeded", succeeded).await.unwrap();

        eventually(|| async { !h.gitops.synced().await.is_empty() }).await;
        let workflow = h.repos.workflows.find_by_id(workflow.id).await.unwrap().unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Deploying);
    }

    #[tokio::test]
    async fn test_unscoped_build_failure_fails_workflow() {
        let h = subscribed().await;
        h.bus
            .publish(types::WEBHOOK_RECEIVED, webhook_event("abc123"))
            .await
            .unwrap();
        eventually(|| async { h.ci.triggered().await.len() == 1 }).await;
        let workflow = workflows(&h).await.remove(0);

        let failed = DomainEvent::new(types::BUILD_FAILED, "ci", "")
            .with_payload("build_id", workflow.build_id)
            .with_payload("error", "compile error");
        h.bus.publish("build.failed", failed).await.unwrap();

        eventually(|| async {
            h.repos
                .workflows
                .find_by_id(workflow.id)
                .await
                .unwrap()
                .is_some_and(|w| w.status == WorkflowStatus::Failed)
        })
        .await;
        assert!(h.gitops.synced().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_event_is_dropped() {
        let h = subscribed().await;
        let event = DomainEvent::new(types::BUILD_FAILED, "ci", "billing-api");

        h.bus.publish(&event.bus_subject(), event).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(h.bus.dead_letters().await.is_empty());
    }
}
