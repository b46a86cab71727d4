//! GitLab adapter
//!
//! GitLab authenticates webhooks with a shared token echoed in
//! `X-Gitlab-Token` instead of an HMAC, and addresses projects by numeric id
//! or URL-encoded path.

use crate::error::{ProviderError, Result};
use crate::http::{ApiClient, encode_segment};
use crate::oauth::{self, Grant};
use crate::signature::tokens_equal;
use crate::{GitProvider, ProviderConfig, WebhookHeaders};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::domain::git::{
    Branch, BranchRef, CommitRef, CreateWebhook, DeployKey, GitEvent, NULL_SHA, OAuthToken,
    PullRequestEvent, PushEvent, Repository, RepositoryRef, Webhook,
};

const DEFAULT_API_URL: &str = "https://gitlab.com/api/v4";
const DEFAULT_WEB_URL: &str = "https://gitlab.com";
const OAUTH_SCOPE: &str = "api read_repository";

pub struct GitLabProvider {
    config: ProviderConfig,
    web_url: String,
    api: ApiClient,
}

impl GitLabProvider {
    pub fn new(config: ProviderConfig) -> Self {
        let api_url = config.api_url.as_deref().unwrap_or(DEFAULT_API_URL);
        let web_url = config
            .web_url
            .as_deref()
            .unwrap_or(DEFAULT_WEB_URL)
            .trim_end_matches('/')
            .to_string();
        Self {
            api: ApiClient::new(api_url, "Bearer"),
            web_url,
            config,
        }
    }

    fn project_path(repo: &str) -> String {
        format!("/projects/{}", encode_segment(repo))
    }
}

#[async_trait]
impl GitProvider for GitLabProvider {
    fn id(&self) -> &'static str {
        "gitlab"
    }

    fn webhook_headers(&self) -> WebhookHeaders {
        WebhookHeaders {
            signature: "x-gitlab-token",
            event: "x-gitlab-event",
            delivery: "x-gitlab-event-uuid",
        }
    }

    fn auth_url(&self, state: &str) -> Result<String> {
        let endpoint = format!("{}/oauth/authorize", self.web_url);
        oauth::authorize_url(&endpoint, &self.config, state, OAUTH_SCOPE)
    }

    async fn exchange_code(&self, code: &str) -> Result<OAuthToken> {
        let endpoint = format!("{}/oauth/token", self.web_url);
        oauth::request_token(
            self.api.http(),
            &endpoint,
            &self.config,
            Grant::AuthorizationCode(code),
        )
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthToken> {
        let endpoint = format!("{}/oauth/token", self.web_url);
        oauth::request_token(
            self.api.http(),
            &endpoint,
            &self.config,
            Grant::RefreshToken(refresh_token),
        )
        .await
    }

    async fn list_repositories(&self, token: &str) -> Result<Vec<Repository>> {
        let projects: Vec<GlProject> = self
            .api
            .get("/projects?membership=true&per_page=100", token)
            .await?;
        Ok(projects
            .into_iter()
            .map(|p| Repository {
                id: p.id.to_string(),
                private: p.visibility.as_deref() != Some("public"),
                full_name: p.path_with_namespace,
                clone_url: p.http_url_to_repo,
                ssh_url: p.ssh_url_to_repo,
                default_branch: p.default_branch,
            })
            .collect())
    }

    async fn list_branches(&self, token: &str, repo: &str) -> Result<Vec<Branch>> {
        let branches: Vec<GlBranch> = self
            .api
            .get(
                &format!("{}/repository/branches?per_page=100", Self::project_path(repo)),
                token,
            )
            .await?;
        Ok(branches
            .into_iter()
            .map(|b| Branch {
                name: b.name,
                sha: b.commit.id,
                protected: b.protected,
            })
            .collect())
    }

    async fn list_commits(&self, token: &str, repo: &str, branch: &str) -> Result<Vec<CommitRef>> {
        let commits: Vec<GlApiCommit> = self
            .api
            .get(
                &format!(
                    "{}/repository/commits?ref_name={}&per_page=50",
                    Self::project_path(repo),
                    encode_segment(branch)
                ),
                token,
            )
            .await?;
        Ok(commits
            .into_iter()
            .map(|c| CommitRef {
                sha: c.id,
                message: c.message,
                author: c.author_name,
                timestamp: c.created_at,
                url: c.web_url,
            })
            .collect())
    }

    async fn create_deploy_key(
        &self,
        token: &str,
        repo: &str,
        title: &str,
        public_key: &str,
        read_only: bool,
    ) -> Result<DeployKey> {
        let body = GlKeyRequest {
            title,
            key: public_key,
            can_push: !read_only,
        };
        let key: GlKey = self
            .api
            .post(
                &format!("{}/deploy_keys", Self::project_path(repo)),
                token,
                &body,
            )
            .await?;
        Ok(key.into())
    }

    async fn list_deploy_keys(&self, token: &str, repo: &str) -> Result<Vec<DeployKey>> {
        let keys: Vec<GlKey> = self
            .api
            .get(&format!("{}/deploy_keys", Self::project_path(repo)), token)
            .await?;
        Ok(keys.into_iter().map(Into::into).collect())
    }

    async fn delete_deploy_key(&self, token: &str, repo: &str, key_id: &str) -> Result<()> {
        self.api
            .delete(
                &format!("{}/deploy_keys/{}", Self::project_path(repo), key_id),
                token,
            )
            .await
    }

    async fn create_webhook(
        &self,
        token: &str,
        repo: &str,
        hook: &CreateWebhook,
    ) -> Result<Webhook> {
        let wants = |name: &str| hook.events.iter().any(|e| e == name);
        let body = GlHookRequest {
            url: &hook.url,
            token: &hook.secret,
            push_events: wants("push"),
            merge_requests_events: wants("pull_request"),
            enable_ssl_verification: true,
        };
        let created: GlHook = self
            .api
            .post(&format!("{}/hooks", Self::project_path(repo)), token, &body)
            .await?;
        Ok(created.into())
    }

    async fn list_webhooks(&self, token: &str, repo: &str) -> Result<Vec<Webhook>> {
        let hooks: Vec<GlHook> = self
            .api
            .get(&format!("{}/hooks", Self::project_path(repo)), token)
            .await?;
        Ok(hooks.into_iter().map(Into::into).collect())
    }

    async fn delete_webhook(&self, token: &str, repo: &str, hook_id: &str) -> Result<()> {
        self.api
            .delete(
                &format!("{}/hooks/{}", Self::project_path(repo), hook_id),
                token,
            )
            .await
    }

    fn validate_webhook_payload(&self, _payload: &[u8], signature: &str, secret: &str) -> bool {
        tokens_equal(signature, secret)
    }

    fn parse_webhook_event(&self, event_type: &str, payload: &[u8]) -> Result<GitEvent> {
        match event_type {
            "Push Hook" | "Tag Push Hook" => {
                let push: GlPushPayload = serde_json::from_slice(payload)?;
                Ok(GitEvent::Push(push.into()))
            }
            "Merge Request Hook" => {
                let mr: GlMergeRequestPayload = serde_json::from_slice(payload)?;
                Ok(GitEvent::PullRequest(mr.into()))
            }
            other => Err(ProviderError::UnsupportedEvent(other.to_string())),
        }
    }
}

/// Map GitLab merge request actions onto the canonical pull request verbs
fn normalize_action(action: &str) -> String {
    match action {
        "open" => "opened",
        "update" => "synchronize",
        "close" | "merge" => "closed",
        "reopen" => "reopened",
        other => other,
    }
    .to_string()
}

// Webhook payloads

#[derive(Debug, Deserialize)]
struct GlPushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    before: String,
    after: String,
    #[serde(default)]
    user_username: Option<String>,
    #[serde(default)]
    user_name: Option<String>,
    project: GlHookProject,
    #[serde(default)]
    commits: Vec<GlHookCommit>,
}

#[derive(Debug, Deserialize)]
struct GlHookProject {
    id: u64,
    path_with_namespace: String,
    git_http_url: String,
    default_branch: Option<String>,
}

impl From<GlHookProject> for RepositoryRef {
    fn from(p: GlHookProject) -> Self {
        RepositoryRef {
            id: p.id.to_string(),
            full_name: p.path_with_namespace,
            clone_url: p.git_http_url,
            default_branch: p.default_branch,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GlHookCommit {
    id: String,
    message: String,
    timestamp: Option<DateTime<Utc>>,
    url: Option<String>,
    author: GlHookAuthor,
}

#[derive(Debug, Deserialize)]
struct GlHookAuthor {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GlMergeRequestPayload {
    user: GlUser,
    project: GlHookProject,
    object_attributes: GlMergeRequest,
}

#[derive(Debug, Deserialize)]
struct GlUser {
    username: String,
}

#[derive(Debug, Deserialize)]
struct GlMergeRequest {
    iid: u64,
    title: String,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    state: Option<String>,
    source_branch: String,
    target_branch: String,
    last_commit: Option<GlLastCommit>,
    merge_commit_sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GlLastCommit {
    id: String,
}

impl From<GlPushPayload> for PushEvent {
    fn from(p: GlPushPayload) -> Self {
        PushEvent {
            deleted: p.after == NULL_SHA,
            actor: p.user_username.or(p.user_name).unwrap_or_default(),
            git_ref: p.git_ref,
            before: p.before,
            after: p.after,
            repository: p.project.into(),
            commits: p
                .commits
                .into_iter()
                .map(|c| CommitRef {
                    sha: c.id,
                    message: c.message,
                    author: c.author.name,
                    timestamp: c.timestamp,
                    url: c.url,
                })
                .collect(),
        }
    }
}

impl From<GlMergeRequestPayload> for PullRequestEvent {
    fn from(p: GlMergeRequestPayload) -> Self {
        let mr = p.object_attributes;
        let merged = mr.action.as_deref() == Some("merge") || mr.state.as_deref() == Some("merged");
        PullRequestEvent {
            action: normalize_action(mr.action.as_deref().unwrap_or("update")),
            number: mr.iid,
            title: mr.title,
            head: BranchRef {
                name: mr.source_branch,
                sha: mr.last_commit.map(|c| c.id).unwrap_or_default(),
            },
            // Merge request hooks do not carry the target branch head
            base: BranchRef {
                name: mr.target_branch,
                sha: String::new(),
            },
            repository: p.project.into(),
            actor: p.user.username,
            merged,
            merge_commit_sha: mr.merge_commit_sha,
        }
    }
}

// REST API shapes

#[derive(Debug, Deserialize)]
struct GlProject {
    id: u64,
    path_with_namespace: String,
    http_url_to_repo: String,
    ssh_url_to_repo: Option<String>,
    default_branch: Option<String>,
    visibility: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GlBranch {
    name: String,
    commit: GlLastCommit,
    #[serde(default)]
    protected: bool,
}

#[derive(Debug, Deserialize)]
struct GlApiCommit {
    id: String,
    message: String,
    author_name: String,
    created_at: Option<DateTime<Utc>>,
    web_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct GlKeyRequest<'a> {
    title: &'a str,
    key: &'a str,
    can_push: bool,
}

#[derive(Debug, Deserialize)]
struct GlKey {
    id: u64,
    title: String,
    key: String,
    #[serde(default)]
    can_push: bool,
}

impl From<GlKey> for DeployKey {
    fn from(k: GlKey) -> Self {
        DeployKey {
            id: k.id.to_string(),
            title: k.title,
            key: k.key,
            read_only: !k.can_push,
        }
    }
}

#[derive(Debug, Serialize)]
struct GlHookRequest<'a> {
    url: &'a str,
    token: &'a str,
    push_events: bool,
    merge_requests_events: bool,
    enable_ssl_verification: bool,
}

#[derive(Debug, Deserialize)]
struct GlHook {
    id: u64,
    url: String,
    #[serde(default)]
    push_events: bool,
    #[serde(default)]
    merge_requests_events: bool,
}

impl From<GlHook> for Webhook {
    fn from(h: GlHook) -> Self {
        let mut events = Vec::new();
        if h.push_events {
            events.push("push".to_string());
        }
        if h.merge_requests_events {
            events.push("pull_request".to_string());
        }
        Webhook {
            id: h.id.to_string(),
            url: h.url,
            events,
            // GitLab has no per-hook enable flag
            active: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Json as JsonBody;
    use axum::routing::post;
    use axum::{Json, Router};

    const PUSH: &str = r#"{
        "object_kind": "push",
        "ref": "refs/heads/main",
        "before": "95790bf891e76fee5e1747ab589903a6a1f80f22",
        "after": "da1560886d4f094c3e6c9ef40349f7d38b5d27d7",
        "user_name": "John Smith",
        "user_username": "jsmith",
        "project": {
            "id": 15,
            "path_with_namespace": "acme/billing-api",
            "git_http_url": "https://gitlab.com/acme/billing-api.git",
            "default_branch": "main"
        },
        "commits": [{
            "id": "da1560886d4f094c3e6c9ef40349f7d38b5d27d7",
            "message": "Update ledger",
            "timestamp": "2025-04-30T12:00:00Z",
            "url": "https://gitlab.com/acme/billing-api/-/commit/da15608",
            "author": { "name": "John Smith", "email": "john@example.com" }
        }]
    }"#;

    const MERGE_REQUEST: &str = r#"{
        "object_kind": "merge_request",
        "user": { "username": "root" },
        "project": {
            "id": 15,
            "path_with_namespace": "acme/billing-api",
            "git_http_url": "https://gitlab.com/acme/billing-api.git",
            "default_branch": "main"
        },
        "object_attributes": {
            "iid": 3,
            "title": "Export ledger",
            "action": "merge",
            "state": "merged",
            "source_branch": "feature/export",
            "target_branch": "main",
            "last_commit": { "id": "da1560886d4f094c3e6c9ef40349f7d38b5d27d7" },
            "merge_commit_sha": "ccc333"
        }
    }"#;

    fn provider() -> GitLabProvider {
        GitLabProvider::new(ProviderConfig::default())
    }

    #[test]
    fn test_validate_token() {
        let gitlab = provider();
        assert!(gitlab.validate_webhook_payload(PUSH.as_bytes(), "hook-token", "hook-token"));
        assert!(!gitlab.validate_webhook_payload(PUSH.as_bytes(), "hook-tokem", "hook-token"));
        assert!(!gitlab.validate_webhook_payload(PUSH.as_bytes(), "", ""));
    }

    #[test]
    fn test_parse_push() {
        let GitEvent::Push(push) = provider()
            .parse_webhook_event("Push Hook", PUSH.as_bytes())
            .unwrap()
        else {
            panic!("expected push event");
        };

        assert_eq!(push.branch(), Some("main"));
        assert_eq!(push.actor, "jsmith");
        assert_eq!(push.repository.id, "15");
        assert_eq!(push.repository.full_name, "acme/billing-api");
        assert_eq!(push.commits[0].sha, push.after);
    }

    #[test]
    fn test_parse_merge_request() {
        let GitEvent::PullRequest(pr) = provider()
            .parse_webhook_event("Merge Request Hook", MERGE_REQUEST.as_bytes())
            .unwrap()
        else {
            panic!("expected pull request event");
        };

        assert_eq!(pr.action, "closed");
        assert!(pr.merged);
        assert_eq!(pr.number, 3);
        assert_eq!(pr.head.name, "feature/export");
        assert_eq!(pr.base.name, "main");
        assert_eq!(pr.merge_commit_sha.as_deref(), Some("ccc333"));
    }

    #[test]
    fn test_parse_unsupported() {
        let err = provider()
            .parse_webhook_event("Pipeline Hook", b"{}")
            .unwrap_err();
        assert!(err.is_unsupported_event());
    }

    #[test]
    fn test_normalize_action() {
        assert_eq!(normalize_action("open"), "opened");
        assert_eq!(normalize_action("update"), "synchronize");
        assert_eq!(normalize_action("approved"), "approved");
    }

    #[tokio::test]
    async fn test_create_webhook_maps_events() {
        let router = Router::new().route(
            "/projects/{project}/hooks",
            post(|JsonBody(body): JsonBody<serde_json::Value>| async move {
                Json(serde_json::json!({
                    "id": 99,
                    "url": body["url"],
                    "push_events": body["push_events"],
                    "merge_requests_events": body["merge_requests_events"],
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let gitlab = GitLabProvider::new(ProviderConfig {
            api_url: Some(format!("http://{}", addr)),
            ..Default::default()
        });
        let hook = gitlab
            .create_webhook(
                "glpat",
                "acme/billing-api",
                &CreateWebhook {
                    url: "https://shipyard.example.com/webhooks/gitlab".to_string(),
                    secret: "hook-token".to_string(),
                    events: vec!["push".to_string()],
                },
            )
            .await
            .unwrap();

        assert_eq!(hook.id, "99");
        assert_eq!(hook.events, vec!["push".to_string()]);
    }
}
