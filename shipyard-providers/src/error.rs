//! Error types for provider adapters

use thiserror::Error;

/// Result type alias for provider operations
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors that can occur when talking to a Git provider or parsing its webhooks
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The webhook event type is not one the platform acts on
    #[error("unsupported event type: {0}")]
    UnsupportedEvent(String),

    /// The event type is recognized but its payload could not be decoded
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Provider API returned an error status code
    #[error("provider API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// OAuth exchange was rejected
    #[error("OAuth error: {0}")]
    OAuth(String),

    /// Adapter configuration is unusable
    #[error("invalid provider configuration: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn is_unsupported_event(&self) -> bool {
        matches!(self, Self::UnsupportedEvent(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Api { status: 401, .. })
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::MalformedPayload(err.to_string())
    }
}
