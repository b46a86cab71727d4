//! Ports to external systems
//!
//! The state machine only talks to CI and GitOps backends through these
//! traits. Adapters translate to a concrete system's API; every call is made
//! through [`retry::RetryPolicy`] so transient failures never reach workflow
//! state.

pub mod argocd;
pub mod http_ci;
pub mod retry;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use shipyard_core::domain::build::{Build, BuildStatus};
use shipyard_core::domain::service::Service;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortError {
    /// Connection-level failure
    #[error("request failed: {0}")]
    Transport(String),

    #[error("{system} returned {status}: {message}")]
    Status {
        system: &'static str,
        status: u16,
        message: String,
    },

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The port is not configured in this deployment
    #[error("{0} is not configured")]
    Unavailable(&'static str),
}

impl PortError {
    /// Whether another attempt might succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            PortError::Transport(_) | PortError::Timeout(_) => true,
            PortError::Status { status, .. } => *status >= 500 || *status == 429,
            PortError::NotFound(_) | PortError::InvalidResponse(_) | PortError::Unavailable(_) => {
                false
            }
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PortError::InvalidResponse(err.to_string())
        } else {
            PortError::Transport(err.to_string())
        }
    }
}

/// What the CI system reports about a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildReport {
    pub external_id: String,
    pub status: BuildStatus,
    /// Image reference once the build succeeded
    pub artifact: Option<String>,
    pub error: Option<String>,
}

pub type LogStream = BoxStream<'static, Result<String, PortError>>;

#[async_trait]
pub trait CiPort: Send + Sync {
    /// Start a build of `build.commit_sha` for `service`.
    ///
    /// `build.id` is passed to the backend as an idempotency key so a retried
    /// trigger does not start a second run.
    async fn trigger_build(&self, service: &Service, build: &Build) -> Result<BuildReport, PortError>;

    async fn get_build_status(&self, external_id: &str) -> Result<BuildReport, PortError>;

    async fn cancel_build(&self, external_id: &str) -> Result<(), PortError>;

    async fn get_build_logs(&self, external_id: &str) -> Result<LogStream, PortError>;
}

/// Target of a deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub namespace: String,
    /// Image produced by the build
    pub image: String,
    /// Git revision the image was built from
    pub revision: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Progressing,
    Degraded,
    Suspended,
    Missing,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Synced,
    OutOfSync,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationStatus {
    pub health: HealthStatus,
    pub sync: SyncStatus,
    /// Revision currently synced
    pub revision: Option<String>,
    pub message: Option<String>,
}

/// Interpretation of an application status for the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutOutcome {
    InProgress,
    Succeeded,
    Failed,
}

impl ApplicationStatus {
    pub fn outcome(&self) -> RolloutOutcome {
        match (self.health, self.sync) {
            (HealthStatus::Healthy, SyncStatus::Synced) => RolloutOutcome::Succeeded,
            (HealthStatus::Degraded | HealthStatus::Missing, _) => RolloutOutcome::Failed,
            _ => RolloutOutcome::InProgress,
        }
    }
}

#[async_trait]
pub trait GitOpsPort: Send + Sync {
    /// Create or update the application for `service`; returns its external id
    async fn create_or_update_application(
        &self,
        service: &Service,
        environment: &Environment,
    ) -> Result<String, PortError>;

    async fn sync_application(&self, external_id: &str) -> Result<(), PortError>;

    async fn get_application_status(&self, external_id: &str)
    -> Result<ApplicationStatus, PortError>;

    async fn rollback(&self, external_id: &str, revision: &str) -> Result<(), PortError>;
}

/// Map a non-success HTTP response to a [`PortError`]
pub(crate) async fn error_for_status(
    system: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, PortError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(PortError::NotFound(message));
    }

    Err(PortError::Status {
        system,
        status: status.as_u16(),
        message,
    })
}

/// Ports used when no backend is configured; every call fails permanently
pub struct UnconfiguredCi;

#[async_trait]
impl CiPort for UnconfiguredCi {
    async fn trigger_build(&self, _: &Service, _: &Build) -> Result<BuildReport, PortError> {
        Err(PortError::Unavailable("CI backend"))
    }

    async fn get_build_status(&self, _: &str) -> Result<BuildReport, PortError> {
        Err(PortError::Unavailable("CI backend"))
    }

    async fn cancel_build(&self, _: &str) -> Result<(), PortError> {
        Err(PortError::Unavailable("CI backend"))
    }

    async fn get_build_logs(&self, _: &str) -> Result<LogStream, PortError> {
        Err(PortError::Unavailable("CI backend"))
    }
}

pub struct UnconfiguredGitOps;

#[async_trait]
impl GitOpsPort for UnconfiguredGitOps {
    async fn create_or_update_application(
        &self,
        _: &Service,
        _: &Environment,
    ) -> Result<String, PortError> {
        Err(PortError::Unavailable("GitOps backend"))
    }

    async fn sync_application(&self, _: &str) -> Result<(), PortError> {
        Err(PortError::Unavailable("GitOps backend"))
    }

    async fn get_application_status(&self, _: &str) -> Result<ApplicationStatus, PortError> {
        Err(PortError::Unavailable("GitOps backend"))
    }

    async fn rollback(&self, _: &str, _: &str) -> Result<(), PortError> {
        Err(PortError::Unavailable("GitOps backend"))
    }
}
