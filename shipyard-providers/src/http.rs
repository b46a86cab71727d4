//! Shared REST plumbing for provider adapters

use crate::error::{ProviderError, Result};
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;

const USER_AGENT: &str = concat!("shipyard/", env!("CARGO_PKG_VERSION"));

/// Authenticated JSON client bound to one provider API base URL
#[derive(Debug, Clone)]
pub(crate) struct ApiClient {
    base_url: String,
    /// `Authorization` scheme, e.g. `Bearer` or `token`
    auth_scheme: &'static str,
    client: Client,
}

impl ApiClient {
    pub(crate) fn new(base_url: impl Into<String>, auth_scheme: &'static str) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_scheme,
            client: Client::new(),
        }
    }

    pub(crate) fn http(&self) -> &Client {
        &self.client
    }

    fn request(&self, method: reqwest::Method, path: &str, token: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("{} {}", method, url);
        self.client
            .request(method, url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(
                reqwest::header::AUTHORIZATION,
                format!("{} {}", self.auth_scheme, token),
            )
    }

    pub(crate) async fn get<T: DeserializeOwned>(&self, path: &str, token: &str) -> Result<T> {
        let response = self
            .request(reqwest::Method::GET, path, token)
            .send()
            .await?;
        handle_response(response).await
    }

    pub(crate) async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        token: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .request(reqwest::Method::POST, path, token)
            .json(body)
            .send()
            .await?;
        handle_response(response).await
    }

    pub(crate) async fn delete(&self, path: &str, token: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, path, token)
            .send()
            .await?;
        handle_empty_response(response).await
    }
}

/// Check the status code and deserialize the JSON body
pub(crate) async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();

    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(ProviderError::api_error(status.as_u16(), error_text));
    }

    response
        .json()
        .await
        .map_err(|e| ProviderError::MalformedPayload(format!("Failed to parse API response: {}", e)))
}

pub(crate) async fn handle_empty_response(response: reqwest::Response) -> Result<()> {
    let status = response.status();

    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(ProviderError::api_error(status.as_u16(), error_text));
    }

    Ok(())
}

/// Percent-encode a repository path for use as a single URL path segment
pub(crate) fn encode_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
