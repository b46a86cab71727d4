//! Shipyard HTTP Client
//!
//! A type-safe HTTP client for the operator API of the Shipyard orchestrator:
//! workflow inspection, manual triggers, cancel and rollback, event history
//! and build logs.
//!
//! # Example
//!
//! ```no_run
//! use shipyard_client::OrchestratorClient;
//! use shipyard_core::dto::workflow::WorkflowQuery;
//!
//! # async fn example() -> shipyard_client::Result<()> {
//! let client = OrchestratorClient::new("http://localhost:8080");
//!
//! for workflow in client.list_workflows(&WorkflowQuery::default()).await? {
//!     println!("{} {}", workflow.id, workflow.status);
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
mod events;
mod services;
mod workflows;

// Re-export commonly used types
pub use error::{ClientError, Result};

use reqwest::Client;
use serde::de::DeserializeOwned;

/// HTTP client for the Shipyard orchestrator API
///
/// Methods are organized into logical groups:
/// - Workflows (list, get, cancel, rollback)
/// - Services (manual trigger)
/// - Event history and build logs
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    /// Base URL of the orchestrator (e.g., "http://localhost:8080")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl OrchestratorClient {
    /// Create a new orchestrator client
    ///
    /// # Example
    /// ```
    /// use shipyard_client::OrchestratorClient;
    ///
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new orchestrator client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the orchestrator
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Check the status code, turning error bodies into [`ClientError`]
    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::debug!("Orchestrator returned {}: {}", status, error_text);
            return Err(ClientError::from_response(status.as_u16(), &error_text));
        }

        Ok(response)
    }

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        self.check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }
}
