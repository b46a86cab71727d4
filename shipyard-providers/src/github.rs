//! GitHub adapter

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

const DEFAULT_API_URL: &str = "https://api.github.com";
const DEFAULT_WEB_URL: &str = "https://github.com";
const OAUTH_SCOPE: &str = "repo admin:repo_hook";
const SIGNATURE_PREFIX: &str = "sha256=";

pub struct GitHubProvider {
    config: ProviderConfig,
    web_url: String,
    api: ApiClient,
}

impl GitHubProvider {
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
}

#[async_trait]
impl GitProvider for GitHubProvider {
    fn id(&self) -> &'static str {
        "github"
    }

    fn webhook_headers(&self) -> WebhookHeaders {
        WebhookHeaders {
            signature: "x-hub-signature-256",
            event: "x-github-event",
            delivery: "x-github-delivery",
        }
    }

    fn auth_url(&self, state: &str) -> Result<String> {
        let endpoint = format!("{}/login/oauth/authorize", self.web_url);
        oauth::authorize_url(&endpoint, &self.config, state, OAUTH_SCOPE)
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
        let repos: Vec<GhRepo> = self
            .api
            .get("/user/repos?per_page=100&sort=updated", token)
            .await?;
        Ok(repos.into_iter().map(Into::into).collect())
    }

    async fn list_branches(&self, token: &str, repo: &str) -> Result<Vec<Branch>> {
        let branches: Vec<GhBranch> = self
            .api
            .get(&format!("/repos/{}/branches?per_page=100", repo), token)
            .await?;
        Ok(branches
            .into_iter()
            .map(|b| Branch {
                name: b.name,
                sha: b.commit.sha,
                protected: b.protected,
            })
            .collect())
    }

    async fn list_commits(&self, token: &str, repo: &str, branch: &str) -> Result<Vec<CommitRef>> {
        let commits: Vec<GhApiCommit> = self
            .api
            .get(
                &format!("/repos/{}/commits?sha={}&per_page=50", repo, branch),
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
        let body = GhKeyRequest {
            title,
            key: public_key,
            read_only,
        };
        let key: GhKey = self
            .api
            .post(&format!("/repos/{}/keys", repo), token, &body)
            .await?;
        Ok(key.into())
    }

    async fn list_deploy_keys(&self, token: &str, repo: &str) -> Result<Vec<DeployKey>> {
        let keys: Vec<GhKey> = self.api.get(&format!("/repos/{}/keys", repo), token).await?;
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
        let body = GhHookRequest {
            name: "web",
            active: true,
            events: &hook.events,
            config: GhHookConfigRequest {
                url: &hook.url,
                content_type: "json",
                secret: &hook.secret,
                insecure_ssl: "0",
            },
        };
        let created: GhHook = self
            .api
            .post(&format!("/repos/{}/hooks", repo), token, &body)
            .await?;
        Ok(created.into())
    }

    async fn list_webhooks(&self, token: &str, repo: &str) -> Result<Vec<Webhook>> {
        let hooks: Vec<GhHook> = self
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
        match signature.strip_prefix(SIGNATURE_PREFIX) {
            Some(hex) => verify_hmac_sha256_hex(secret.as_bytes(), payload, hex),
            None => false,
        }
    }

    fn parse_webhook_event(&self, event_type: &str, payload: &[u8]) -> Result<GitEvent> {
        match event_type {
            "push" => {
                let push: GhPushPayload = serde_json::from_slice(payload)?;
                Ok(GitEvent::Push(push.into()))
            }
            "pull_request" => {
                let pr: GhPullRequestPayload = serde_json::from_slice(payload)?;
                Ok(GitEvent::PullRequest(pr.into()))
            }
            other => Err(ProviderError::UnsupportedEvent(other.to_string())),
        }
    }
}

// Webhook payloads

#[derive(Debug, Deserialize)]
struct GhPushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    before: String,
    after: String,
    repository: GhRepo,
    #[serde(default)]
    commits: Vec<GhPushCommit>,
    pusher: Option<GhPusher>,
    sender: Option<GhUser>,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct GhPushCommit {
    id: String,
    message: String,
    timestamp: Option<DateTime<Utc>>,
    url: Option<String>,
    author: GhCommitAuthor,
}

#[derive(Debug, Deserialize)]
struct GhCommitAuthor {
    name: String,
    #[serde(default)]
    date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GhPusher {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhPullRequestPayload {
    action: String,
    number: u64,
    pull_request: GhPullRequest,
    repository: GhRepo,
    sender: GhUser,
}

#[derive(Debug, Deserialize)]
struct GhPullRequest {
    title: String,
    head: GhBranchRef,
    base: GhBranchRef,
    #[serde(default)]
    merged: Option<bool>,
    merge_commit_sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhBranchRef {
    #[serde(rename = "ref")]
    name: String,
    sha: String,
}

impl From<GhPushPayload> for PushEvent {
    fn from(p: GhPushPayload) -> Self {
        let actor = p
            .pusher
            .map(|u| u.name)
            .or(p.sender.map(|u| u.login))
            .unwrap_or_default();
        PushEvent {
            deleted: p.deleted || p.after == NULL_SHA,
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
            actor,
        }
    }
}

impl From<GhPullRequestPayload> for PullRequestEvent {
    fn from(p: GhPullRequestPayload) -> Self {
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
            merged: p.pull_request.merged.unwrap_or(false),
            merge_commit_sha: p.pull_request.merge_commit_sha,
        }
    }
}

// REST API shapes

#[derive(Debug, Deserialize)]
struct GhRepo {
    id: u64,
    full_name: String,
    clone_url: String,
    ssh_url: Option<String>,
    default_branch: Option<String>,
    #[serde(default)]
    private: bool,
}

impl From<GhRepo> for RepositoryRef {
    fn from(r: GhRepo) -> Self {
        RepositoryRef {
            id: r.id.to_string(),
            full_name: r.full_name,
            clone_url: r.clone_url,
            default_branch: r.default_branch,
        }
    }
}

impl From<GhRepo> for Repository {
    fn from(r: GhRepo) -> Self {
        Repository {
            id: r.id.to_string(),
            full_name: r.full_name,
            clone_url: r.clone_url,
            ssh_url: r.ssh_url,
            default_branch: r.default_branch,
            private: r.private,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhBranch {
    name: String,
    commit: GhShaRef,
    #[serde(default)]
    protected: bool,
}

#[derive(Debug, Deserialize)]
struct GhShaRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GhApiCommit {
    sha: String,
    html_url: Option<String>,
    commit: GhApiCommitDetail,
}

#[derive(Debug, Deserialize)]
struct GhApiCommitDetail {
    message: String,
    author: GhCommitAuthor,
}

#[derive(Debug, Serialize)]
struct GhKeyRequest<'a> {
    title: &'a str,
    key: &'a str,
    read_only: bool,
}

#[derive(Debug, Deserialize)]
struct GhKey {
    id: u64,
    title: String,
    key: String,
    #[serde(default)]
    read_only: bool,
}

impl From<GhKey> for DeployKey {
    fn from(k: GhKey) -> Self {
        DeployKey {
            id: k.id.to_string(),
            title: k.title,
            key: k.key,
            read_only: k.read_only,
        }
    }
}

#[derive(Debug, Serialize)]
struct GhHookRequest<'a> {
    name: &'a str,
    active: bool,
    events: &'a [String],
    config: GhHookConfigRequest<'a>,
}

#[derive(Debug, Serialize)]
struct GhHookConfigRequest<'a> {
    url: &'a str,
    content_type: &'a str,
    secret: &'a str,
    insecure_ssl: &'a str,
}

#[derive(Debug, Deserialize)]
struct GhHook {
    id: u64,
    #[serde(default)]
    events: Vec<String>,
    #[serde(default)]
    active: bool,
    config: GhHookConfig,
}

#[derive(Debug, Deserialize)]
struct GhHookConfig {
    #[serde(default)]
    url: String,
}

impl From<GhHook> for Webhook {
    fn from(h: GhHook) -> Self {
        Webhook {
            id: h.id.to_string(),
            url: h.config.url,
            events: h.events,
            active: h.active,
        }
    }
}
