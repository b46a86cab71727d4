//! Operator API DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::build::Build;
use crate::domain::deployment::Deployment;
use crate::domain::workflow::{Workflow, WorkflowStatus};

/// Request to build and deploy a service at a given commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerService {
    pub commit_sha: String,
    /// Defaults to the service's tracked branch
    pub branch: Option<String>,
}

/// Result of accepting a trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerOutcome {
    pub workflow: Workflow,
    /// True when the trigger was folded into an already active workflow
    pub coalesced: bool,
}

/// Filters for listing workflows
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowQuery {
    pub service_id: Option<Uuid>,
    pub status: Option<WorkflowStatus>,
    pub limit: Option<usize>,
}

/// Workflow together with its child entities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDetails {
    pub workflow: Workflow,
    pub build: Option<Build>,
    pub deployment: Option<Deployment>,
}

/// Filters for the event history endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventQuery {
    /// Subject pattern, wildcards allowed
    pub subject: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}
