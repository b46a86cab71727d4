//! Domain event bus
//!
//! Publish/subscribe contract with at-least-once delivery, queue groups for
//! load-balanced consumers, request/reply, and bounded history. Subjects are
//! dot-separated; subscriptions may use `*` (one token) and `>` (the rest).

pub mod memory;

use async_trait::async_trait;
use shipyard_core::domain::event::{DomainEvent, EventRecord};
use shipyard_core::dto::workflow::EventQuery;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub use memory::{EventBusConfig, InMemoryEventBus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Uuid);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    /// A handler rejected the event; the bus redelivers it
    #[error("handler failed: {0}")]
    Handler(String),

    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),

    #[error("no responders for {0}")]
    NoResponders(String),

    #[error("request on {0} timed out")]
    Timeout(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("event bus is shut down")]
    Closed,
}

/// Consumer of bus deliveries.
///
/// Handlers must be idempotent: a failed delivery is retried, and publishers
/// may themselves deliver more than once. The returned event is the reply
/// for [`EventBus::request`] and is ignored for plain publishes.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, subject: &str, event: DomainEvent)
    -> Result<Option<DomainEvent>, BusError>;
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, subject: &str, event: DomainEvent) -> Result<(), BusError>;

    async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId, BusError>;

    /// Each matching event goes to exactly one member of `group`
    async fn queue_subscribe(
        &self,
        pattern: &str,
        group: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId, BusError>;

    /// Deliver to a single responder and wait for its reply
    async fn request(
        &self,
        subject: &str,
        event: DomainEvent,
        timeout: Duration,
    ) -> Result<DomainEvent, BusError>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError>;

    /// Retained events matching the query, oldest first
    async fn history(&self, query: &EventQuery) -> Result<Vec<EventRecord>, BusError>;
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(String, DomainEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<DomainEvent>, BusError>> + Send + 'static,
{
    async fn handle(
        &self,
        subject: &str,
        event: DomainEvent,
    ) -> Result<Option<DomainEvent>, BusError> {
        (self.0)(subject.to_string(), event).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(String, DomainEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<DomainEvent>, BusError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Reject empty subjects and empty tokens
pub(crate) fn validate_subject(subject: &str) -> Result<(), BusError> {
    if subject.is_empty() || subject.split('.').any(str::is_empty) {
        return Err(BusError::InvalidSubject(subject.to_string()));
    }
    Ok(())
}
