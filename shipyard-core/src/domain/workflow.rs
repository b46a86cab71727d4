//! Workflow domain types
//!
//! A Workflow correlates one trigger (webhook delivery or manual action) with the
//! Build and Deployment it produced. Its status graph is:
//!
//! ```text
//! Pending -> Building -> Deploying -> Succeeded -> RolledBack
//!    |           |            |
//!    +-----------+------------+-----> Failed
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Correlation record for one trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub service_id: Uuid,
    pub trigger: Trigger,
    pub build_id: Uuid,
    pub deployment_id: Option<Uuid>,
    pub status: WorkflowStatus,
    /// Human-readable summary, always set once the workflow is `Failed`
    pub error: Option<String>,
    /// Optimistic concurrency token, bumped on every persisted update
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Workflow {
    /// Create a pending workflow for `trigger` and its freshly created build
    pub fn pending(service_id: Uuid, build_id: Uuid, trigger: Trigger) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            service_id,
            trigger,
            build_id,
            deployment_id: None,
            status: WorkflowStatus::Pending,
            error: None,
            version: 0,
            created_at: now,
            updated_at: now,
            last_activity_at: now,
        }
    }

    /// Idempotency key used to coalesce duplicate triggers
    pub fn idempotency_key(&self) -> (Uuid, &str) {
        (self.service_id, self.trigger.commit_sha.as_str())
    }

    /// Move to `next`, stamping activity timestamps.
    ///
    /// The persisted `version` is left untouched; repositories bump it when the
    /// update is accepted.
    pub fn transition(
        &mut self,
        next: WorkflowStatus,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        self.updated_at = now;
        self.last_activity_at = now;
        Ok(())
    }

    /// Transition to `Failed` with an operator-facing error summary
    pub fn fail(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition(WorkflowStatus::Failed, now)?;
        self.error = Some(reason.into());
        Ok(())
    }
}

/// What started a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    /// Provider registry id, for webhook triggers
    pub provider: Option<String>,
    /// Provider delivery id, for webhook triggers
    pub delivery_id: Option<String>,
    pub commit_sha: String,
    pub branch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Webhook,
    Manual,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Webhook => write!(f, "webhook"),
            TriggerKind::Manual => write!(f, "manual"),
        }
    }
}

/// Workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Building,
    Deploying,
    Succeeded,
    Failed,
    RolledBack,
}

impl WorkflowStatus {
    pub const ALL: [WorkflowStatus; 6] = [
        WorkflowStatus::Pending,
        WorkflowStatus::Building,
        WorkflowStatus::Deploying,
        WorkflowStatus::Succeeded,
        WorkflowStatus::Failed,
        WorkflowStatus::RolledBack,
    ];

    /// Statuses in which the workflow is still waiting on external work
    pub const ACTIVE: [WorkflowStatus; 3] = [
        WorkflowStatus::Pending,
        WorkflowStatus::Building,
        WorkflowStatus::Deploying,
    ];

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    /// The only edges of the workflow graph
    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;

        matches!(
            (self, next),
            (Pending, Building)
                | (Building, Deploying)
                | (Deploying, Succeeded)
                | (Pending | Building | Deploying, Failed)
                | (Succeeded, RolledBack)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Building => "building",
            WorkflowStatus::Deploying => "deploying",
            WorkflowStatus::Succeeded => "succeeded",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rejected edge of the workflow graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid workflow transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: WorkflowStatus,
    pub to: WorkflowStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_trigger() -> Trigger {
        Trigger {
            kind: TriggerKind::Manual,
            provider: None,
            delivery_id: None,
            commit_sha: "abc123".to_string(),
            branch: "main".to_string(),
        }
    }

    #[test]
    fn test_transition_graph_is_exact() {
        use WorkflowStatus::*;

        let allowed = [
            (Pending, Building),
            (Building, Deploying),
            (Deploying, Succeeded),
            (Pending, Failed),
            (Building, Failed),
            (Deploying, Failed),
            (Succeeded, RolledBack),
        ];

        for from in WorkflowStatus::ALL {
            for to in WorkflowStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!WorkflowStatus::Pending.is_terminal());
        assert!(!WorkflowStatus::Building.is_terminal());
        assert!(!WorkflowStatus::Deploying.is_terminal());
        assert!(WorkflowStatus::Succeeded.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::RolledBack.is_terminal());
    }

    #[test]
    fn test_fail_records_reason() {
        let mut workflow = Workflow::pending(Uuid::new_v4(), Uuid::new_v4(), manual_trigger());
        workflow.transition(WorkflowStatus::Building, Utc::now()).unwrap();
        workflow.fail("ci unavailable", Utc::now()).unwrap();

        assert_eq!(workflow.status, WorkflowStatus::Failed);
        assert_eq!(workflow.error.as_deref(), Some("ci unavailable"));
        assert!(workflow.fail("again", Utc::now()).is_err());
    }

    #[test]
    fn test_invalid_transition_leaves_workflow_untouched() {
        let mut workflow = Workflow::pending(Uuid::new_v4(), Uuid::new_v4(), manual_trigger());
        let before = workflow.clone();

        let err = workflow
            .transition(WorkflowStatus::Succeeded, Utc::now())
            .unwrap_err();

        assert_eq!(err.from, WorkflowStatus::Pending);
        assert_eq!(workflow, before);
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in WorkflowStatus::ALL {
            assert_eq!(WorkflowStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(WorkflowStatus::parse("bogus"), None);
    }
}
