//! OAuth authorization-code flow shared by all adapters

use crate::ProviderConfig;
use crate::error::{ProviderError, Result};
use chrono::{Duration, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use shipyard_core::domain::git::OAuthToken;

/// Raw token endpoint response.
///
/// Some providers report failures with a 200 and an `error` field.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    token_type: Option<String>,
    scope: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Build an authorization URL with properly encoded query parameters
pub(crate) fn authorize_url(
    endpoint: &str,
    config: &ProviderConfig,
    state: &str,
    scope: &str,
) -> Result<String> {
    if config.client_id.is_empty() {
        return Err(ProviderError::Config("client id is not set".to_string()));
    }

    let url = Url::parse_with_params(
        endpoint,
        &[
            ("client_id", config.client_id.as_str()),
            ("redirect_uri", config.redirect_url.as_str()),
            ("response_type", "code"),
            ("scope", scope),
            ("state", state),
        ],
    )
    .map_err(|e| ProviderError::Config(format!("invalid OAuth endpoint {}: {}", endpoint, e)))?;

    Ok(url.into())
}

pub(crate) enum Grant<'a> {
    AuthorizationCode(&'a str),
    RefreshToken(&'a str),
}

/// POST a grant to the token endpoint and normalize the response
pub(crate) async fn request_token(
    client: &Client,
    token_endpoint: &str,
    config: &ProviderConfig,
    grant: Grant<'_>,
) -> Result<OAuthToken> {
    let mut form = vec![
        ("client_id", config.client_id.as_str()),
        ("client_secret", config.client_secret.as_str()),
        ("redirect_uri", config.redirect_url.as_str()),
    ];
    match grant {
        Grant::AuthorizationCode(code) => {
            form.push(("grant_type", "authorization_code"));
            form.push(("code", code));
        }
        Grant::RefreshToken(token) => {
            form.push(("grant_type", "refresh_token"));
            form.push(("refresh_token", token));
        }
    }

    let response = client
        .post(token_endpoint)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&form)
        .send()
        .await?;

    let body: TokenResponse = crate::http::handle_response(response).await?;
    into_token(body)
}

fn into_token(body: TokenResponse) -> Result<OAuthToken> {
    if let Some(error) = body.error {
        let message = match body.error_description {
            Some(description) => format!("{}: {}", error, description),
            None => error,
        };
        return Err(ProviderError::OAuth(message));
    }

    let access_token = body
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ProviderError::OAuth("token response has no access_token".to_string()))?;

    Ok(OAuthToken {
        access_token,
        refresh_token: body.refresh_token.filter(|t| !t.is_empty()),
        token_type: body.token_type.unwrap_or_else(|| "bearer".to_string()),
        scope: body.scope,
        expires_at: body
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProviderConfig {
        ProviderConfig {
            client_id: "abc".to_string(),
            client_secret: "shh".to_string(),
            redirect_url: "https://shipyard.example.com/oauth/callback".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_authorize_url_encodes_params() {
        let url = authorize_url(
            "https://github.com/login/oauth/authorize",
            &config(),
            "st ate",
            "repo admin:repo_hook",
        )
        .unwrap();

        assert!(url.starts_with("https://github.com/login/oauth/authorize?client_id=abc"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fshipyard.example.com%2Foauth%2Fcallback"));
        assert!(url.contains("state=st+ate"));
    }

    #[test]
    fn test_authorize_url_requires_client_id() {
        let err = authorize_url("https://x", &ProviderConfig::default(), "s", "").unwrap_err();
        assert!(matches!(err, ProviderError::Config(_)));
    }

    #[test]
    fn test_token_error_in_success_body() {
        let body: TokenResponse = serde_json::from_str(
            r#"{"error":"bad_verification_code","error_description":"The code passed is incorrect or expired."}"#,
        )
        .unwrap();
        let err = into_token(body).unwrap_err();
        assert!(matches!(err, ProviderError::OAuth(msg) if msg.starts_with("bad_verification_code")));
    }

    #[test]
    fn test_token_expiry() {
        let body: TokenResponse = serde_json::from_str(
            r#"{"access_token":"gho_x","refresh_token":"ghr_y","token_type":"bearer","expires_in":28800}"#,
        )
        .unwrap();
        let token = into_token(body).unwrap();
        assert_eq!(token.access_token, "gho_x");
        assert_eq!(token.refresh_token.as_deref(), Some("ghr_y"));
        assert!(token.expires_at.unwrap() > Utc::now());
    }
}
