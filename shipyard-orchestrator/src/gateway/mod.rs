//! Webhook Gateway
//!
//! One-shot pipeline per delivery: resolve the adapter, authenticate the raw
//! bytes, de-duplicate by delivery id, parse, and republish as a canonical
//! domain event. Nothing here branches on provider identity; the adapter's
//! [`WebhookHeaders`](shipyard_providers::WebhookHeaders) say where to look.

pub mod dedup;

use axum::http::{HeaderMap, StatusCode};
use serde::Serialize;
use sha2::{Digest, Sha256};
use shipyard_core::domain::event::{DomainEvent, META_DELIVERY_ID, types};
use shipyard_providers::ProviderRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::bus::{BusError, EventBus};
pub use dedup::DeliveryDedup;

pub const SOURCE: &str = "webhook-gateway";

/// Metadata key carrying the provider id
pub const META_PROVIDER: &str = "provider";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("missing signature header")]
    MissingSignature,

    /// No webhook secret configured, so nothing can be authenticated
    #[error("webhooks are not configured for {0}")]
    NotConfigured(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("missing event type header")]
    MissingEventType,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("failed to publish event: {0}")]
    Publish(#[from] BusError),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownProvider(_) => StatusCode::NOT_FOUND,
            Self::MissingSignature | Self::NotConfigured(_) | Self::InvalidSignature => {
                StatusCode::UNAUTHORIZED
            }
            Self::MissingEventType | Self::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            Self::Publish(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// What happened to an authenticated delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Accepted {
        delivery_id: String,
        event: &'static str,
    },
    /// Already processed within the de-duplication window
    Duplicate { delivery_id: String },
    /// Event type the platform does not act on
    Ignored { event_type: String },
}

impl WebhookOutcome {
    /// Pull requests only start asynchronous work, so they are answered with 202
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Accepted { event, .. } if *event == "pull_request" => StatusCode::ACCEPTED,
            _ => StatusCode::OK,
        }
    }
}

pub struct WebhookGateway {
    providers: Arc<ProviderRegistry>,
    /// Webhook secret per provider id
    secrets: HashMap<String, String>,
    dedup: Arc<DeliveryDedup>,
    bus: Arc<dyn EventBus>,
}

impl WebhookGateway {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        secrets: HashMap<String, String>,
        dedup: Arc<DeliveryDedup>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            providers,
            secrets,
            dedup,
            bus,
        }
    }

    pub fn dedup(&self) -> &Arc<DeliveryDedup> {
        &self.dedup
    }

    /// Process one delivery of `body` to `/webhooks/{provider_id}`
    pub async fn handle(
        &self,
        provider_id: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookOutcome, GatewayError> {
        let provider = self
            .providers
            .get(provider_id)
            .ok_or_else(|| GatewayError::UnknownProvider(provider_id.to_string()))?;
        let names = provider.webhook_headers();

        let signature = header(headers, names.signature).ok_or(GatewayError::MissingSignature)?;
        let secret = self
            .secrets
            .get(provider_id)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                tracing::warn!("Rejecting {} webhook: no secret configured", provider_id);
                GatewayError::NotConfigured(provider_id.to_string())
            })?;

        if !provider.validate_webhook_payload(body, signature, secret) {
            tracing::warn!("Rejecting {} webhook: invalid signature", provider_id);
            return Err(GatewayError::InvalidSignature);
        }

        let delivery_id = header(headers, names.delivery)
            .map(str::to_string)
            .unwrap_or_else(|| hex::encode(Sha256::digest(body)));
        let event_type = header(headers, names.event).ok_or(GatewayError::MissingEventType)?;

        let key = format!("{}:{}", provider_id, delivery_id);
        if !self.dedup.claim(&key).await {
            tracing::info!("Duplicate {} delivery {} ignored", provider_id, delivery_id);
            return Ok(WebhookOutcome::Duplicate { delivery_id });
        }

        let git_event = match provider.parse_webhook_event(event_type, body) {
            Ok(event) => event,
            Err(e) if e.is_unsupported_event() => {
                tracing::debug!("Ignoring {} event type {}", provider_id, event_type);
                return Ok(WebhookOutcome::Ignored {
                    event_type: event_type.to_string(),
                });
            }
            Err(e) => {
                self.dedup.release(&key).await;
                return Err(GatewayError::MalformedPayload(e.to_string()));
            }
        };

        let event = DomainEvent::new(
            types::WEBHOOK_RECEIVED,
            SOURCE,
            git_event.repository().full_name.clone(),
        )
        .with_payload("event", &git_event)
        .with_metadata(META_DELIVERY_ID, delivery_id.as_str())
        .with_metadata(META_PROVIDER, provider_id);

        if let Err(e) = self.bus.publish(types::WEBHOOK_RECEIVED, event.clone()).await {
            // Nothing went out; let the provider's retry through
            self.dedup.release(&key).await;
            tracing::error!("Failed to publish {} delivery {}: {}", provider_id, delivery_id, e);
            return Err(e.into());
        }

        // The canonical event is out, so the claim stays even if this fails
        let specific = format!("webhook.{}.{}", provider_id, git_event.kind());
        if let Err(e) = self.bus.publish(&specific, event).await {
            tracing::error!(
                "Failed to publish {} delivery {} on {}: {}",
                provider_id,
                delivery_id,
                specific,
                e
            );
        }

        tracing::info!(
            "Accepted {} {} delivery {} for {}",
            provider_id,
            git_event.kind(),
            delivery_id,
            git_event.repository().full_name
        );

        Ok(WebhookOutcome::Accepted {
            delivery_id,
            event: git_event.kind(),
        })
    }

}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
