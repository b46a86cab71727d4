//! Shipyard Git provider adapters
//!
//! Each supported Git host implements [`GitProvider`]: OAuth, repository
//! listing, deploy-key and webhook management, and webhook verification and
//! parsing into the canonical [`GitEvent`] shapes. Adapters are looked up
//! through a [`ProviderRegistry`] built once at start-up, so adding a provider
//! never touches the webhook gateway.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shipyard_providers::{GitHubProvider, ProviderConfig, ProviderRegistry};
//!
//! let mut registry = ProviderRegistry::new();
//! registry.register(Arc::new(GitHubProvider::new(ProviderConfig::default())));
//!
//! assert!(registry.get("github").is_some());
//! ```

pub mod error;
mod gitea;
mod github;
mod gitlab;
mod http;
mod oauth;
pub mod signature;

pub use error::{ProviderError, Result};
pub use gitea::GiteaProvider;
pub use github::GitHubProvider;
pub use gitlab::GitLabProvider;

use async_trait::async_trait;
use shipyard_core::domain::git::{
    Branch, CommitRef, CreateWebhook, DeployKey, GitEvent, OAuthToken, Repository, Webhook,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Header names a provider uses on webhook deliveries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebhookHeaders {
    /// Signature (HMAC) or shared token header
    pub signature: &'static str,
    /// Event type header
    pub event: &'static str,
    /// Unique delivery identifier header
    pub delivery: &'static str,
}

/// OAuth application and endpoint settings for one provider
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    /// REST API base URL; each adapter has a public-cloud default
    pub api_url: Option<String>,
    /// Web base URL used for OAuth pages
    pub web_url: Option<String>,
}

/// Contract every Git provider adapter satisfies
#[async_trait]
pub trait GitProvider: Send + Sync {
    /// Registry key, also the `{provider}` path segment of the webhook route
    fn id(&self) -> &'static str;

    fn webhook_headers(&self) -> WebhookHeaders;

    /// URL the user is redirected to for OAuth consent
    fn auth_url(&self, state: &str) -> Result<String>;

    async fn exchange_code(&self, code: &str) -> Result<OAuthToken>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthToken>;

    async fn list_repositories(&self, token: &str) -> Result<Vec<Repository>>;

    async fn list_branches(&self, token: &str, repo: &str) -> Result<Vec<Branch>>;

    async fn list_commits(&self, token: &str, repo: &str, branch: &str) -> Result<Vec<CommitRef>>;

    async fn create_deploy_key(
        &self,
        token: &str,
        repo: &str,
        title: &str,
        public_key: &str,
        read_only: bool,
    ) -> Result<DeployKey>;

    async fn list_deploy_keys(&self, token: &str, repo: &str) -> Result<Vec<DeployKey>>;

    async fn delete_deploy_key(&self, token: &str, repo: &str, key_id: &str) -> Result<()>;

    async fn create_webhook(&self, token: &str, repo: &str, hook: &CreateWebhook)
    -> Result<Webhook>;

    async fn list_webhooks(&self, token: &str, repo: &str) -> Result<Vec<Webhook>>;

    async fn delete_webhook(&self, token: &str, repo: &str, hook_id: &str) -> Result<()>;

    /// Verify a delivery against the shared secret.
    ///
    /// `payload` must be the exact bytes received, before any JSON decoding.
    /// Comparison is constant-time. An empty secret never validates.
    fn validate_webhook_payload(&self, payload: &[u8], signature: &str, secret: &str) -> bool;

    /// Parse a verified delivery.
    ///
    /// Event types the platform does not act on yield
    /// [`ProviderError::UnsupportedEvent`].
    fn parse_webhook_event(&self, event_type: &str, payload: &[u8]) -> Result<GitEvent>;
}

/// Provider adapters keyed by [`GitProvider::id`]
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<&'static str, Arc<dyn GitProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one with the same id
    pub fn register(&mut self, provider: Arc<dyn GitProvider>) -> &mut Self {
        let id = provider.id();
        if self.adapters.insert(id, provider).is_some() {
            tracing::warn!("Replacing provider adapter: {}", id);
        }
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn GitProvider>> {
        self.adapters.get(id).cloned()
    }

    /// Registered ids in sorted order
    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<_> = self.adapters.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
