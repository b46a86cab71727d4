//! Deployment domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One GitOps sync attempt for a succeeded Build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub service_id: Uuid,
    pub build_id: Uuid,
    pub status: DeploymentStatus,
    /// Application identifier in the GitOps system
    pub external_id: Option<String>,
    /// Revision the GitOps system synced (used as the rollback target)
    pub revision: Option<String>,
    /// Version served by this deployment, usually the build artifact
    pub version: String,
    pub replicas: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DeploymentStatus::Succeeded | DeploymentStatus::Failed | DeploymentStatus::RolledBack
        )
    }

    /// Whether a deployment stored in this status may be rewritten as `next`.
    ///
    /// Terminal deployments are immutable, except that a success can later be
    /// rolled back.
    pub fn accepts(self, next: DeploymentStatus) -> bool {
        !self.is_terminal()
            || (self == DeploymentStatus::Succeeded && next == DeploymentStatus::RolledBack)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::InProgress => "in_progress",
            DeploymentStatus::Succeeded => "succeeded",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_deployments_are_immutable() {
        use DeploymentStatus::*;

        assert!(Pending.accepts(InProgress));
        assert!(InProgress.accepts(Failed));
        assert!(Succeeded.accepts(RolledBack));

        assert!(!Failed.accepts(InProgress));
        assert!(!Succeeded.accepts(Failed));
        assert!(!RolledBack.accepts(Succeeded));
    }
}
