//! Gitea adapter
//!
//! Self-hosted only, so `api_url` must point at the instance's `/api/v1`.
//! Webhook signatures are a bare hex HMAC-SHA256 in `X-Gitea-Signature`.

use crate::error::{ProviderError, Result};
use crate::http::ApiClient;
use crate::oauth::{self, Grant};
use crate::signature::verify_hmac_sha256_hex;
use crate::{GitProvider, ProviderConfig, WebhookHeaders};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::domain::git::{
    Branch, BranchRef, CommitRef, CreateWebhook, DeployKey, GitEvent, NULL_SHA, OAuthToken,
    PullRequestEvent, PushEvent, Repository, RepositoryRef, Webhook,
};

const DEFAULT_WEB_URL: &str = "http://localhost:3000";

pub struct GiteaProvider {
    config: ProviderConfig,
    web_url: String,
    api: ApiClient,
}

impl GiteaProvider {
    pub fn new(config: ProviderConfig) -> Self {
        let web_url = config
            .web_url
            .as_deref()
            .unwrap_or(DEFAULT_WEB_URL)
            .trim_end_matches('/')
            .to_string();
        let api_url = config
            .api_url
            .clone()
            .unwrap_or_else(|| format!("{}/api/v1", web_url));
        Self {
            api: ApiClient::new(api_url, "token"),
            web_url,
            config,
        }
    }
}

#[async_trait]
impl GitProvider for GiteaProvider {
    fn id(&self) -> &'static str {
        "gitea"
    }

    fn webhook_headers(&self) -> WebhookHeaders {
        WebhookHeaders {
            signature: "x-gitea-signature",
            event: "x-gitea-event",
            delivery: "x-gitea-delivery",
        }
    }

    fn auth_url(&self, state: &str) -> Result<String> {
        let endpoint = format!("{}/login/oauth/authorize", self.web_url);
        oauth::authorize_url(&endpoint, &self.config, state, "")
    }

    async fn exchange_code(&self, code: &str) -> Result<OAuthToken> {
        let endpoint = format!("{}/login/oauth/access_token", self.web_url);
        oauth::request_token(
            self.api.http(),
            &endpoint,
            &self.config,
            Grant::AuthorizationCode(code),
        )
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthToken> {
        let endpoint = format!("{}/login/oauth/access_token", self.web_url);
        oauth::request_token(
            self.api.http(),
            &endpoint,
            &self.config,
            Grant::RefreshToken(refresh_token),
        )
        .await
    }

    async fn list_repositories(&self, token: &str) -> Result<Vec<Repository>> {
        let repos: Vec<GtRepo> = self.api.get("/user/repos?limit=50", token).await?;
        Ok(repos
            .into_iter()
            .map(|r| Repository {
                id: r.id.to_string(),
                full_name: r.full_name,
                clone_url: r.clone_url,
                ssh_url: r.ssh_url,
                default_branch: r.default_branch,
                private: r.private,
            })
            .collect())
    }

    async fn list_branches(&self, token: &str, repo: &str) -> Result<Vec<Branch>> {
        let branches: Vec<GtBranch> = self
            .api
            .get(&format!("/repos/{}/branches", repo), token)
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
        let commits: Vec<GtApiCommit> = self
            .api
            .get(
                &format!("/repos/{}/commits?sha={}&limit=50", repo, branch),
                token,
            )
            .await?;
        Ok(commits
            .into_iter()
            .map(|c| CommitRef {
                sha: c.sha,
                message: c.commit.message,
                author: c.commit.author.name,
                timestamp: c.commit.author.date,
                url: c.html_url,
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
        let body = GtKeyRequest {
            title,
            key: public_key,
            read_only,
        };
        let key: GtKey = self
            .api
            .post(&format!("/repos/{}/keys", repo), token, &body)
            .await?;
        Ok(key.into())
    }

    async fn list_deploy_keys(&self, token: &str, repo: &str) -> Result<Vec<DeployKey>> {
        let keys: Vec<GtKey> = self.api.get(&format!("/repos/{}/keys", repo), token).await?;
        Ok(keys.into_iter().map(Into::into).collect())
    }

    async fn delete_deploy_key(&self, token: &str, repo: &str, key_id: &str) -> Result<()> {
        self.api
            .delete(&format!("/repos/{}/keys/{}", repo, key_id), token)
            .await
    }

    async fn create_webhook(
        &self,
        token: &str,
        repo: &str,
        hook: &CreateWebhook,
    ) -> Result<Webhook> {
        let body = GtHookRequest {
            hook_type: "gitea",
            active: true,
            events: &hook.events,
            config: GtHookConfigRequest {
                url: &hook.url,
                content_type: "json",
                secret: &hook.secret,
            },
        };
        let created: GtHook = self
            .api
            .post(&format!("/repos/{}/hooks", repo), token, &body)
            .await?;
        Ok(created.into())
    }

    async fn list_webhooks(&self, token: &str, repo: &str) -> Result<Vec<Webhook>> {
        let hooks: Vec<GtHook> = self
            .api
            .get(&format!("/repos/{}/hooks", repo), token)
            .await?;
        Ok(hooks.into_iter().map(Into::into).collect())
    }

    async fn delete_webhook(&self, token: &str, repo: &str, hook_id: &str) -> Result<()> {
        self.api
            .delete(&format!("/repos/{}/hooks/{}", repo, hook_id), token)
            .await
    }

    fn validate_webhook_payload(&self, payload: &[u8], signature: &str, secret: &str) -> bool {
        verify_hmac_sha256_hex(secret.as_bytes(), payload, signature)
    }

    fn parse_webhook_event(&self, event_type: &str, payload: &[u8]) -> Result<GitEvent> {
        match event_type {
            "push" => {
                let push: GtPushPayload = serde_json::from_slice(payload)?;
                Ok(GitEvent::Push(push.into()))
            }
            "pull_request" => {
                let pr: GtPullRequestPayload = serde_json::from_slice(payload)?;
                Ok(GitEvent::PullRequest(pr.into()))
            }
            other => Err(ProviderError::UnsupportedEvent(other.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GtRepo {
    id: u64,
    full_name: String,
    clone_url: String,
    ssh_url: Option<String>,
    default_branch: Option<String>,
    #[serde(default)]
    private: bool,
}

impl From<GtRepo> for RepositoryRef {
    fn from(r: GtRepo) -> Self {
        RepositoryRef {
            id: r.id.to_string(),
            full_name: r.full_name,
            clone_url: r.clone_url,
            default_branch: r.default_branch,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GtUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GtPushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    before: String,
    after: String,
    repository: GtRepo,
    #[serde(default)]
    commits: Vec<GtPushCommit>,
    pusher: Option<GtUser>,
    sender: Option<GtUser>,
}

#[derive(Debug, Deserialize)]
struct GtPushCommit {
    id: String,
    message: String,
    url: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    author: GtAuthor,
}

#[derive(Debug, Deserialize)]
struct GtAuthor {
    name: String,
    #[serde(default)]
    date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GtPullRequestPayload {
    action: String,
    number: u64,
    pull_request: GtPullRequest,
    repository: GtRepo,
    sender: GtUser,
}

#[derive(Debug, Deserialize)]
struct GtPullRequest {
    title: String,
    head: GtBranchRef,
    base: GtBranchRef,
    #[serde(default)]
    merged: bool,
    merge_commit_sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GtBranchRef {
    #[serde(rename = "ref")]
    name: String,
    sha: String,
}

impl From<GtPushPayload> for PushEvent {
    fn from(p: GtPushPayload) -> Self {
        PushEvent {
            deleted: p.after == NULL_SHA,
            actor: p
                .pusher
                .or(p.sender)
                .map(|u| u.login)
                .unwrap_or_default(),
            git_ref: p.git_ref,
            before: p.before,
            after: p.after,
            repository: p.repository.into(),
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

impl From<GtPullRequestPayload> for PullRequestEvent {
    fn from(p: GtPullRequestPayload) -> Self {
        PullRequestEvent {
            action: p.action,
            number: p.number,
            title: p.pull_request.title,
            head: BranchRef {
                name: p.pull_request.head.name,
                sha: p.pull_request.head.sha,
            },
            base: BranchRef {
                name: p.pull_request.base.name,
                sha: p.pull_request.base.sha,
            },
            repository: p.repository.into(),
            actor: p.sender.login,
            merged: p.pull_request.merged,
            merge_commit_sha: p.pull_request.merge_commit_sha,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GtBranch {
    name: String,
    commit: GtBranchCommit,
    #[serde(default)]
    protected: bool,
}

#[derive(Debug, Deserialize)]
struct GtBranchCommit {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GtApiCommit {
    sha: String,
    html_url: Option<String>,
    commit: GtApiCommitDetail,
}

#[derive(Debug, Deserialize)]
struct GtApiCommitDetail {
    message: String,
    author: GtAuthor,
}

#[derive(Debug, Serialize)]
struct GtKeyRequest<'a> {
    title: &'a str,
    key: &'a str,
    read_only: bool,
}

#[derive(Debug, Deserialize)]
struct GtKey {
    id: u64,
    title: String,
    key: String,
    #[serde(default)]
    read_only: bool,
}

impl From<GtKey> for DeployKey {
    fn from(k: GtKey) -> Self {
        DeployKey {
            id: k.id.to_string(),
            title: k.title,
            key: k.key,
            read_only: k.read_only,
        }
    }
}

#[derive(Debug, Serialize)]
struct GtHookRequest<'a> {
    #[serde(rename = "type")]
    hook_type: &'a str,
    active: bool,
    events: &'a [String],
    config: GtHookConfigRequest<'a>,
}

#[derive(Debug, Serialize)]
struct GtHookConfigRequest<'a> {
    url: &'a str,
    content_type: &'a str,
    secret: &'a str,
}

#[derive(Debug, Deserialize)]
struct GtHook {
    id: u64,
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    active: bool,
    config: std::collections::HashMap<String, String>,
}

impl From<GtHook> for Webhook {
    fn from(mut h: GtHook) -> Self {
        Webhook {
            id: h.id.to_string(),
            url: h.config.remove("url").unwrap_or_default(),
            events: h.events,
            active: h.active,
        }
    }
}
