//! Canonical Git provider types
//!
//! Provider adapters translate their own payloads and API responses into these
//! shapes so the rest of the system never sees provider field names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SHA used by providers for "no commit" (branch creation/deletion)
pub const NULL_SHA: &str = "0000000000000000000000000000000000000000";

/// A webhook event the platform acts on.
///
/// Closed set: anything else is rejected by the adapter as unsupported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GitEvent {
    Push(PushEvent),
    PullRequest(PullRequestEvent),
}

impl GitEvent {
    /// Short name used in bus subjects (`webhook.<provider>.<kind>`)
    pub fn kind(&self) -> &'static str {
        match self {
            GitEvent::Push(_) => "push",
            GitEvent::PullRequest(_) => "pull_request",
        }
    }

    pub fn repository(&self) -> &RepositoryRef {
        match self {
            GitEvent::Push(push) => &push.repository,
            GitEvent::PullRequest(pr) => &pr.repository,
        }
    }
}

/// Identity of the repository an event concerns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRef {
    /// Provider-side id, stringified
    pub id: String,
    /// `owner/name` (GitLab: full namespace path)
    pub full_name: String,
    pub clone_url: String,
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    /// Full ref, e.g. `refs/heads/main`
    pub git_ref: String,
    pub before: String,
    pub after: String,
    pub repository: RepositoryRef,
    pub commits: Vec<CommitRef>,
    pub actor: String,
    /// Set when the push deleted the ref
    #[serde(default)]
    pub deleted: bool,
}

impl PushEvent {
    /// Branch name when the ref is a branch, `None` for tags
    pub fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/heads/")
    }

    pub fn is_tag(&self) -> bool {
        self.git_ref.starts_with("refs/tags/")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestEvent {
    /// Provider action normalized to lowercase (`opened`, `synchronize`, `closed`, ...)
    pub action: String,
    pub number: u64,
    pub title: String,
    pub head: BranchRef,
    pub base: BranchRef,
    pub repository: RepositoryRef,
    pub actor: String,
    pub merged: bool,
    pub merge_commit_sha: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRef {
    pub name: String,
    pub sha: String,
}

// =============================================================================
// Provider API shapes
// =============================================================================

/// OAuth token set returned by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub scope: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub full_name: String,
    pub clone_url: String,
    pub ssh_url: Option<String>,
    pub default_branch: Option<String>,
    pub private: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub sha: String,
    pub protected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployKey {
    pub id: String,
    pub title: String,
    pub key: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub url: String,
    pub events: Vec<String>,
    pub active: bool,
}

/// Parameters for registering a webhook on a repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateWebhook {
    pub url: String,
    pub secret: String,
    pub events: Vec<String>,
}
