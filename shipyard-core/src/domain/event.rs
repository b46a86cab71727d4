//! Canonical domain events
//!
//! Every event carried by the bus uses the same envelope. Event types are
//! dot-delimited `domain.action` names; subjects extend them with the entity
//! they concern (`deployment.started.<service-id>`), which lets consumers
//! subscribe with wildcards such as `build.>`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Event type names produced and consumed by the orchestration core
pub mod types {
    pub const WEBHOOK_RECEIVED: &str = "webhook.received";
    pub const BUILD_TRIGGERED: &str = "build.triggered";
    pub const BUILD_SUCCEEDED: &str = "build.succeeded";
    pub const BUILD_FAILED: &str = "build.failed";
    pub const DEPLOYMENT_STARTED: &str = "deployment.started";
    pub const DEPLOYMENT_SUCCEEDED: &str = "deployment.succeeded";
    pub const DEPLOYMENT_FAILED: &str = "deployment.failed";
    pub const DEPLOYMENT_ROLLED_BACK: &str = "deployment.rolled_back";
}

/// Metadata key carrying the provider delivery id of webhook-originated events
pub const META_DELIVERY_ID: &str = "delivery_id";

/// Immutable event envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: Uuid,
    /// Dot-delimited `domain.action`
    pub event_type: String,
    /// Component that produced the event (`webhook-gateway`, `orchestrator`, ...)
    pub source: String,
    /// Entity the event is about
    pub subject: String,
    pub payload: HashMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl DomainEvent {
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            source: source.into(),
            subject: subject.into(),
            payload: HashMap::new(),
            timestamp: Utc::now(),
            correlation_id: None,
            causation_id: None,
            metadata: HashMap::new(),
        }
    }

    /// Add a payload entry. Values that fail to serialize are stored as `null`.
    pub fn with_payload(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.payload.insert(key.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Mark this event as caused by `parent`, inheriting its correlation id
    pub fn caused_by(mut self, parent: &DomainEvent) -> Self {
        self.causation_id = Some(parent.id);
        self.correlation_id = parent.correlation_id.or(Some(parent.id));
        self
    }

    /// Deserialize a payload entry
    pub fn payload_field<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.payload
            .get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    /// Bus subject for this event: `{event_type}.{subject}`
    pub fn bus_subject(&self) -> String {
        subject_for(&self.event_type, &self.subject)
    }
}

/// An event as retained in bus history, with the subject it was published on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub subject: String,
    pub event: DomainEvent,
}

/// Build a hierarchical subject `{domain}.{action}.{entity}`.
///
/// Dots inside `entity` would add tokens, so they are replaced with `_`.
pub fn subject_for(event_type: &str, entity: &str) -> String {
    if entity.is_empty() {
        return event_type.to_string();
    }
    format!("{}.{}", event_type, entity.replace('.', "_"))
}

/// Match a subject against a subscription pattern.
///
/// Tokens are dot-separated. `*` matches exactly one token; `>` as the last
/// token matches one or more remaining tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
