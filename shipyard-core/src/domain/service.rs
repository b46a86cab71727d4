//! Service domain types
//!
//! A Service is the deployable unit. It is created through the API and only its
//! status and current build/version pointers are mutated by the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A deployable unit owned by a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub slug: String,
    pub source: BuildSource,
    pub status: ServiceStatus,
    pub current_build_id: Option<Uuid>,
    pub current_deployment_id: Option<Uuid>,
    /// Version (commit or image tag) currently served
    pub current_version: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Where and how a Service is built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSource {
    pub repository_url: String,
    pub branch: String,
    pub kind: BuildKind,
}

impl BuildSource {
    /// Returns true if a push to `repository_url`/`branch` should build this source.
    ///
    /// Repository URLs are compared after normalisation so that
    /// `https://github.com/acme/api.git` matches `git@github.com:acme/api`.
    pub fn tracks(&self, repository_url: &str, branch: &str) -> bool {
        self.branch == branch
            && normalize_repository_url(&self.repository_url)
                == normalize_repository_url(repository_url)
    }
}

/// Build strategy handed to the CI system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildKind {
    /// Let the CI system detect the strategy
    Auto,
    Dockerfile,
    Buildpack,
    Static,
}

/// Lifecycle status of a Service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Pending,
    Building,
    Deploying,
    Running,
    Failed,
    Stopped,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceStatus::Pending => "pending",
            ServiceStatus::Building => "building",
            ServiceStatus::Deploying => "deploying",
            ServiceStatus::Running => "running",
            ServiceStatus::Failed => "failed",
            ServiceStatus::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// Reduce a clone URL to `host/owner/repo` in lowercase.
///
/// Handles https, ssh (`git@host:owner/repo`) and `ssh://` forms, trailing
/// slashes and the `.git` suffix.
pub fn normalize_repository_url(url: &str) -> String {
    let mut s = url.trim().to_lowercase();

    for scheme in ["https://", "http://", "ssh://", "git://"] {
        if let Some(rest) = s.strip_prefix(scheme) {
            s = rest.to_string();
            break;
        }
    }

    // Drop credentials (user@ / user:token@)
    if let Some(at) = s.find('@') {
        if s[..at].find('/').is_none() {
            s = s[at + 1..].to_string();
        }
    }

    // scp-like syntax: host:owner/repo
    if let Some(colon) = s.find(':') {
        if s[..colon].find('/').is_none() {
            let (host, path) = s.split_at(colon);
            let path = path[1..].trim_start_matches(|c: char| c.is_ascii_digit());
            s = format!("{}/{}", host, path.trim_start_matches('/'));
        }
    }

    let s = s.trim_end_matches('/');
    s.strip_suffix(".git").unwrap_or(s).to_string()
}
