//! Build domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One CI run for a Service at a specific commit
///
/// Mutated only by the orchestrator in reaction to CI Port status; immutable
/// once its status is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub service_id: Uuid,
    pub status: BuildStatus,
    pub commit_sha: String,
    /// Identifier assigned by the CI system once the build is triggered
    pub external_id: Option<String>,
    /// Produced artifact reference (e.g. an image digest)
    pub artifact: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Build {
    /// Create a queued build for `commit_sha`
    pub fn queued(service_id: Uuid, commit_sha: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            service_id,
            status: BuildStatus::Queued,
            commit_sha: commit_sha.into(),
            external_id: None,
            artifact: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Build execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Canceled
        )
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStatus::Queued => "queued",
            BuildStatus::Running => "running",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}
