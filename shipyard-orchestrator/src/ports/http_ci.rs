//! CI Port adapter for a generic build service REST API
//!
//! ```text
//! POST /builds              {idempotency_key, service, repository_url, branch, commit_sha, build_kind}
//! GET  /builds/{id}
//! POST /builds/{id}/cancel
//! GET  /builds/{id}/logs    text/plain, one line per log line
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use shipyard_core::domain::build::{Build, BuildStatus};
use shipyard_core::domain::service::{BuildKind, Service};

use super::{BuildReport, CiPort, LogStream, PortError, error_for_status};

const SYSTEM: &str = "ci";

#[derive(Debug, Clone)]
pub struct HttpCiClient {
    base_url: String,
    token: Option<String>,
    client: Client,
}

#[derive(Debug, Serialize)]
struct TriggerRequest<'a> {
    /// Lets the CI service drop a repeated trigger for the same build
    idempotency_key: String,
    service: &'a str,
    repository_url: &'a str,
    branch: &'a str,
    commit_sha: &'a str,
    build_kind: BuildKind,
}

#[derive(Debug, Deserialize)]
struct CiBuild {
    id: String,
    status: String,
    #[serde(default)]
    artifact: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpCiClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client: Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, PortError> {
        let response = request.send().await.map_err(PortError::from_reqwest)?;
        error_for_status(SYSTEM, response).await
    }

    async fn fetch_build(&self, request: RequestBuilder) -> Result<BuildReport, PortError> {
        let build: CiBuild = self
            .send(request)
            .await?
            .json()
            .await
            .map_err(PortError::from_reqwest)?;
        into_report(build)
    }
}

fn parse_status(raw: &str) -> Option<BuildStatus> {
    match raw.to_ascii_lowercase().as_str() {
        "queued" | "pending" => Some(BuildStatus::Queued),
        "running" | "in_progress" => Some(BuildStatus::Running),
        "succeeded" | "success" => Some(BuildStatus::Succeeded),
        "failed" | "failure" | "error" => Some(BuildStatus::Failed),
        "canceled" | "cancelled" => Some(BuildStatus::Canceled),
        _ => None,
    }
}

fn into_report(build: CiBuild) -> Result<BuildReport, PortError> {
    let status = parse_status(&build.status).ok_or_else(|| {
        PortError::InvalidResponse(format!("unknown build status '{}'", build.status))
    })?;

    Ok(BuildReport {
        external_id: build.id,
        status,
        artifact: build.artifact,
        error: build.error,
    })
}

#[async_trait]
impl CiPort for HttpCiClient {
    async fn trigger_build(&self, service: &Service, build: &Build) -> Result<BuildReport, PortError> {
        let body = TriggerRequest {
            idempotency_key: build.id.to_string(),
            service: &service.slug,
            repository_url: &service.source.repository_url,
            branch: &service.source.branch,
            commit_sha: &build.commit_sha,
            build_kind: service.source.kind,
        };

        tracing::debug!("Triggering CI build for {} at {}", service.slug, build.commit_sha);
        self.fetch_build(self.request(reqwest::Method::POST, "/builds").json(&body))
            .await
    }

    async fn get_build_status(&self, external_id: &str) -> Result<BuildReport, PortError> {
        let path = format!("/builds/{}", external_id);
        self.fetch_build(self.request(reqwest::Method::GET, &path))
            .await
    }

    async fn cancel_build(&self, external_id: &str) -> Result<(), PortError> {
        let path = format!("/builds/{}/cancel", external_id);
        self.send(self.request(reqwest::Method::POST, &path)).await?;
        Ok(())
    }

    async fn get_build_logs(&self, external_id: &str) -> Result<LogStream, PortError> {
        let path = format!("/builds/{}/logs", external_id);
        let response = self.send(self.request(reqwest::Method::GET, &path)).await?;
        Ok(split_lines(response.bytes_stream()))
    }
}

/// Re-chunk a byte stream into lines; a trailing partial line is emitted at the end
fn split_lines<S, B>(bytes: S) -> LogStream
where
    S: futures::Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send,
{
    let state = (Box::pin(bytes), Vec::<u8>::new(), false);

    futures::stream::unfold(state, |(mut bytes, mut buffer, mut done)| async move {
        loop {
            if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..line.len() - 1])
                    .trim_end_matches('\r')
                    .to_string();
                return Some((Ok(line), (bytes, buffer, done)));
            }

            if done {
                if buffer.is_empty() {
                    return None;
                }
                let line = String::from_utf8_lossy(&buffer).to_string();
                buffer.clear();
                return Some((Ok(line), (bytes, buffer, done)));
            }

            match bytes.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    done = true;
                    buffer.clear();
                    return Some((Err(PortError::from_reqwest(e)), (bytes, buffer, done)));
                }
                None => done = true,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{serve, service};
    use axum::{
        Json, Router,
        extract::Path,
        http::{HeaderMap, StatusCode},
        routing::{get, post},
    };
    use futures::TryStreamExt;

    #[test]
    fn test_status_vocabulary() {
        assert_eq!(parse_status("SUCCESS"), Some(BuildStatus::Succeeded));
        assert_eq!(parse_status("in_progress"), Some(BuildStatus::Running));
        assert_eq!(parse_status("cancelled"), Some(BuildStatus::Canceled));
        assert_eq!(parse_status("exploded"), None);
    }

    #[tokio::test]
    async fn test_trigger_sends_idempotency_key_and_build_kind() {
        let router = Router::new().route(
            "/builds",
            post(|headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                assert_eq!(
                    headers.get("authorization").and_then(|v| v.to_str().ok()),
                    Some("Bearer ci-token")
                );
                assert_eq!(body["build_kind"], "dockerfile");
                assert_eq!(body["commit_sha"], "abc123");
                Json(serde_json::json!({
                    "id": format!("ci-{}", body["idempotency_key"].as_str().unwrap_or_default()),
                    "status": "queued",
                }))
            }),
        );
        let client = HttpCiClient::new(serve(router).await, Some("ci-token".to_string()));

        let svc = service();
        let build = Build::queued(svc.id, "abc123");
        let report = client.trigger_build(&svc, &build).await.unwrap();

        assert_eq!(report.external_id, format!("ci-{}", build.id));
        assert_eq!(report.status, BuildStatus::Queued);
    }

    #[tokio::test]
    async fn test_status_errors_are_classified() {
        let router = Router::new().route(
            "/builds/{id}",
            get(|Path(id): Path<String>| async move {
                match id.as_str() {
                    "done" => (
                        StatusCode::OK,
                        Json(serde_json::json!({
                            "id": "done",
                            "status": "success",
                            "artifact": "registry.local/billing-api:abc123"
                        })),
                    ),
                    "flaky" => (
                        StatusCode::SERVICE_UNAVAILABLE,
                        Json(serde_json::json!({"error": "try later"})),
                    ),
                    _ => (
                        StatusCode::NOT_FOUND,
                        Json(serde_json::json!({"error": "no such build"})),
                    ),
                }
            }),
        );
        let client = HttpCiClient::new(serve(router).await, None);

        let report = client.get_build_status("done").await.unwrap();
        assert_eq!(report.status, BuildStatus::Succeeded);
        assert_eq!(
            report.artifact.as_deref(),
            Some("registry.local/billing-api:abc123")
        );

        let err = client.get_build_status("flaky").await.unwrap_err();
        assert!(err.is_retryable());

        let err = client.get_build_status("gone").await.unwrap_err();
        assert!(matches!(err, PortError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_logs_are_split_into_lines() {
        let router = Router::new().route(
            "/builds/{id}/logs",
            get(|| async { "step 1: fetch\r\nstep 2: build\nstep 3: push" }),
        );
        let client = HttpCiClient::new(serve(router).await, None);

        let lines: Vec<String> = client
            .get_build_logs("ci-1")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(lines, vec!["step 1: fetch", "step 2: build", "step 3: push"]);
    }

    #[tokio::test]
    async fn test_split_lines_across_chunks() {
        let chunks: Vec<Result<&'static [u8], reqwest::Error>> =
            vec![Ok(b"hel"), Ok(b"lo\nwor"), Ok(b"ld\n")];
        let lines: Vec<String> = split_lines(futures::stream::iter(chunks))
            .try_collect()
            .await
            .unwrap();

        assert_eq!(lines, vec!["hello", "world"]);
    }
}
