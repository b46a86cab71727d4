//! In-process event bus
//!
//! Each subscription owns an unbounded queue drained by one worker task, so
//! deliveries to a subscription are processed in publish order and a slow
//! handler never blocks publishers. Failed deliveries are retried with a
//! fixed backoff and then parked in a bounded dead-letter list.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipyard_core::domain::event::{DomainEvent, EventRecord, subject_matches};
use shipyard_core::dto::workflow::EventQuery;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{BusError, EventBus, EventHandler, SubscriptionId, validate_subject};

/// Default number of history entries returned when a query sets no limit
const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Redeliveries after the first failed attempt
    pub max_redeliveries: u32,
    pub redelivery_backoff: Duration,
    pub history_capacity: usize,
    pub dead_letter_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_redeliveries: 3,
            redelivery_backoff: Duration::from_millis(500),
            history_capacity: 10_000,
            dead_letter_capacity: 1_000,
        }
    }
}

/// A delivery that exhausted its redeliveries
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub subject: String,
    pub event: DomainEvent,
    pub error: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

type Reply = oneshot::Sender<Result<Option<DomainEvent>, BusError>>;

struct Delivery {
    subject: String,
    event: DomainEvent,
    reply: Option<Reply>,
}

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    group: Option<String>,
    sender: mpsc::UnboundedSender<Delivery>,
    worker: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    subscriptions: Vec<Subscription>,
    /// Round-robin position per (group, pattern)
    cursors: HashMap<(String, String), usize>,
}

impl Registry {
    /// Senders that should receive an event published on `subject`
    fn route(&mut self, subject: &str) -> Vec<mpsc::UnboundedSender<Delivery>> {
        let mut targets = Vec::new();
        let mut groups: HashMap<(String, String), Vec<&Subscription>> = HashMap::new();

        for sub in self
            .subscriptions
            .iter()
            .filter(|s| subject_matches(&s.pattern, subject))
        {
            match &sub.group {
                None => targets.push(sub.sender.clone()),
                Some(group) => groups
                    .entry((group.clone(), sub.pattern.clone()))
                    .or_default()
                    .push(sub),
            }
        }

        for (key, members) in groups {
            let cursor = self.cursors.entry(key).or_insert(0);
            let member = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            targets.push(member.sender.clone());
        }

        targets
    }
}

struct Inner {
    config: EventBusConfig,
    registry: Mutex<Registry>,
    history: Mutex<VecDeque<EventRecord>>,
    dead_letters: Arc<Mutex<VecDeque<DeadLetter>>>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct InMemoryEventBus {
    inner: Arc<Inner>,
}

impl InMemoryEventBus {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(Registry::default()),
                history: Mutex::new(VecDeque::new()),
                dead_letters: Arc::new(Mutex::new(VecDeque::new())),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().await.iter().cloned().collect()
    }

    /// Stop accepting events and let workers drain for at most `grace`
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.closed.store(true, Ordering::SeqCst);

        let subscriptions = std::mem::take(&mut self.inner.registry.lock().await.subscriptions);
        let mut workers = Vec::with_capacity(subscriptions.len());
        for sub in subscriptions {
            // Dropping the sender ends the worker once its queue is empty
            drop(sub.sender);
            workers.push(sub.worker);
        }

        let drain = async {
            for worker in workers.iter_mut() {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!("Event bus workers did not drain within {:?}", grace);
            for worker in &workers {
                worker.abort();
            }
        }
    }

    async fn record(&self, subject: &str, event: &DomainEvent) {
        let mut history = self.inner.history.lock().await;
        if history.len() >= self.inner.config.history_capacity {
            history.pop_front();
        }
        history.push_back(EventRecord {
            subject: subject.to_string(),
            event: event.clone(),
        });
    }

    async fn add_subscription(
        &self,
        pattern: &str,
        group: Option<&str>,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId, BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        validate_subject(pattern)?;

        let id = SubscriptionId(Uuid::new_v4());
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(
            receiver,
            handler,
            self.inner.config.clone(),
            self.inner.dead_letters.clone(),
        ));

        self.inner.registry.lock().await.subscriptions.push(Subscription {
            id,
            pattern: pattern.to_string(),
            group: group.map(str::to_string),
            sender,
            worker,
        });

        tracing::debug!("Subscribed {} to {} (group: {:?})", id, pattern, group);
        Ok(id)
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, subject: &str, event: DomainEvent) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        validate_subject(subject)?;

        self.record(subject, &event).await;

        let targets = self.inner.registry.lock().await.route(subject);
        tracing::debug!("Publishing {} to {} subscriber(s)", subject, targets.len());

        for target in targets {
            let delivery = Delivery {
                subject: subject.to_string(),
                event: event.clone(),
                reply: None,
            };
            if target.send(delivery).is_err() {
                tracing::debug!("Dropped delivery on {} to a closed subscription", subject);
            }
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId, BusError> {
        self.add_subscription(pattern, None, handler).await
    }

    async fn queue_subscribe(
        &self,
        pattern: &str,
        group: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId, BusError> {
        self.add_subscription(pattern, Some(group), handler).await
    }

    async fn request(
        &self,
        subject: &str,
        event: DomainEvent,
        timeout: Duration,
    ) -> Result<DomainEvent, BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        validate_subject(subject)?;

        let responder = self.inner.registry.lock().await.route(subject).into_iter().next();
        let Some(responder) = responder else {
            return Err(BusError::NoResponders(subject.to_string()));
        };

        self.record(subject, &event).await;

        let (reply_tx, reply_rx) = oneshot::channel();
        responder
            .send(Delivery {
                subject: subject.to_string(),
                event,
                reply: Some(reply_tx),
            })
            .map_err(|_| BusError::NoResponders(subject.to_string()))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Err(_) => Err(BusError::Timeout(subject.to_string())),
            Ok(Err(_)) => Err(BusError::NoResponders(subject.to_string())),
            Ok(Ok(Ok(Some(reply)))) => Ok(reply),
            Ok(Ok(Ok(None))) => Err(BusError::Handler(format!(
                "responder on {} sent no reply",
                subject
            ))),
            Ok(Ok(Err(e))) => Err(e),
        }
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        let mut registry = self.inner.registry.lock().await;
        let position = registry
            .subscriptions
            .iter()
            .position(|s| s.id == id)
            .ok_or(BusError::SubscriptionNotFound(id))?;

        // Worker finishes what is already queued, then exits
        registry.subscriptions.remove(position);
        tracing::debug!("Unsubscribed {}", id);
        Ok(())
    }

    async fn history(&self, query: &EventQuery) -> Result<Vec<EventRecord>, BusError> {
        let history = self.inner.history.lock().await;
        let mut matched: Vec<EventRecord> = history
            .iter()
            .filter(|r| {
                query
                    .subject
                    .as_deref()
                    .is_none_or(|pattern| subject_matches(pattern, &r.subject))
            })
            .filter(|r| query.since.is_none_or(|since| r.event.timestamp >= since))
            .filter(|r| query.until.is_none_or(|until| r.event.timestamp <= until))
            .cloned()
            .collect();

        let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        if matched.len() > limit {
            matched.drain(..matched.len() - limit);
        }
        Ok(matched)
    }
}

async fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<Delivery>,
    handler: Arc<dyn EventHandler>,
    config: EventBusConfig,
    dead_letters: Arc<Mutex<VecDeque<DeadLetter>>>,
) {
    while let Some(mut delivery) = receiver.recv().await {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match handler
                .handle(&delivery.subject, delivery.event.clone())
                .await
            {
                Ok(reply) => {
                    if let Some(tx) = delivery.reply.take() {
                        let _ = tx.send(Ok(reply));
                    }
                    break;
                }
                Err(e) if attempt <= config.max_redeliveries => {
                    tracing::warn!(
                        "Handler failed for {} (attempt {}/{}): {}",
                        delivery.subject,
                        attempt,
                        config.max_redeliveries + 1,
                        e
                    );
                    tokio::time::sleep(config.redelivery_backoff).await;
                }
                Err(e) => {
                    tracing::error!(
                        "Dead-lettering {} event {} after {} attempts: {}",
                        delivery.subject,
                        delivery.event.id,
                        attempt,
                        e
                    );

                    let mut letters = dead_letters.lock().await;
                    if letters.len() >= config.dead_letter_capacity {
                        letters.pop_front();
                    }
                    letters.push_back(DeadLetter {
                        subject: delivery.subject.clone(),
                        event: delivery.event.clone(),
                        error: e.to_string(),
                        attempts: attempt,
                        failed_at: Utc::now(),
                    });
                    drop(letters);

                    if let Some(tx) = delivery.reply.take() {
                        let _ = tx.send(Err(e));
                    }
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler_fn;
    use std::sync::atomic::AtomicU32;

    fn fast_bus() -> InMemoryEventBus {
        InMemoryEventBus::new(EventBusConfig {
            max_redeliveries: 2,
            redelivery_backoff: Duration::from_millis(1),
            history_capacity: 5,
            dead_letter_capacity: 10,
        })
    }

    fn event(event_type: &str) -> DomainEvent {
        DomainEvent::new(event_type, "test", "svc-1")
    }

    /// Handler that forwards each delivered subject to a channel
    fn recorder(tx: mpsc::UnboundedSender<String>) -> Arc<dyn EventHandler> {
        handler_fn(move |subject, _event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(subject);
                Ok(None)
            }
        })
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_wildcard_fan_out() {
        let bus = fast_bus();
        let (all_tx, mut all_rx) = mpsc::unbounded_channel();
        let (one_tx, mut one_rx) = mpsc::unbounded_channel();

        bus.subscribe("build.>", recorder(all_tx)).await.unwrap();
        bus.subscribe("build.*", recorder(one_tx)).await.unwrap();

        bus.publish("build.succeeded.svc-1", event("build.succeeded"))
            .await
            .unwrap();
        bus.publish("build.triggered", event("build.triggered"))
            .await
            .unwrap();
        bus.publish("deployment.started.svc-1", event("deployment.started"))
            .await
            .unwrap();

        assert_eq!(recv(&mut all_rx).await.as_deref(), Some("build.succeeded.svc-1"));
        assert_eq!(recv(&mut all_rx).await.as_deref(), Some("build.triggered"));
        assert_eq!(recv(&mut one_rx).await.as_deref(), Some("build.triggered"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(all_rx.try_recv().is_err());
        assert!(one_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_queue_group_delivers_once() {
        let bus = fast_bus();
        let counts: Vec<Arc<AtomicU32>> = (0..2).map(|_| Arc::new(AtomicU32::new(0))).collect();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for count in &counts {
            let count = count.clone();
            let done_tx = done_tx.clone();
            bus.queue_subscribe(
                "webhook.received",
                "orchestrator",
                handler_fn(move |subject, _| {
                    let count = count.clone();
                    let done_tx = done_tx.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        let _ = done_tx.send(subject);
                        Ok(None)
                    }
                }),
            )
            .await
            .unwrap();
        }

        for _ in 0..10 {
            bus.publish("webhook.received", event("webhook.received"))
                .await
                .unwrap();
        }
        for _ in 0..10 {
            assert!(recv(&mut done_rx).await.is_some());
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(done_rx.try_recv().is_err());
        assert_eq!(counts[0].load(Ordering::SeqCst), 5);
        assert_eq!(counts[1].load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_redelivery_then_success() {
        let bus = fast_bus();
        let attempts = Arc::new(AtomicU32::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let counter = attempts.clone();
        bus.subscribe(
            "build.failed.>",
            handler_fn(move |subject, _| {
                let counter = counter.clone();
                let tx = tx.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(BusError::Handler("database unavailable".to_string()));
                    }
                    let _ = tx.send(subject);
                    Ok(None)
                }
            }),
        )
        .await
        .unwrap();

        bus.publish("build.failed.svc-1", event("build.failed"))
            .await
            .unwrap();

        assert!(recv(&mut rx).await.is_some());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(bus.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_dead_letter_after_exhaustion() {
        let bus = fast_bus();
        bus.subscribe(
            "deployment.>",
            handler_fn(|_, _| async { Err(BusError::Handler("always".to_string())) }),
        )
        .await
        .unwrap();

        bus.publish("deployment.failed.svc-1", event("deployment.failed"))
            .await
            .unwrap();

        let mut letters = Vec::new();
        for _ in 0..100 {
            letters = bus.dead_letters().await;
            if !letters.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(letters[0].subject, "deployment.failed.svc-1");
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = fast_bus();
        bus.subscribe(
            "status.get",
            handler_fn(|_, request: DomainEvent| async move {
                Ok(Some(
                    DomainEvent::new("status.reply", "responder", request.subject.clone())
                        .caused_by(&request),
                ))
            }),
        )
        .await
        .unwrap();

        let request = event("status.get");
        let reply = bus
            .request("status.get", request.clone(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.event_type, "status.reply");
        assert_eq!(reply.causation_id, Some(request.id));

        let err = bus
            .request("nobody.home", event("x"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoResponders(_)));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let bus = fast_bus();
        bus.subscribe(
            "slow.op",
            handler_fn(|_, _| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(None)
            }),
        )
        .await
        .unwrap();

        let err = bus
            .request("slow.op", event("slow.op"), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_filtered() {
        let bus = fast_bus();
        for i in 0..7 {
            let subject = if i % 2 == 0 {
                format!("build.triggered.svc-{}", i)
            } else {
                format!("deployment.started.svc-{}", i)
            };
            bus.publish(&subject, event("x")).await.unwrap();
        }

        let all = bus.history(&EventQuery::default()).await.unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].subject, "build.triggered.svc-2");

        let builds = bus
            .history(&EventQuery {
                subject: Some("build.>".to_string()),
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        let subjects: Vec<_> = builds.iter().map(|r| r.subject.as_str()).collect();
        assert_eq!(subjects, vec!["build.triggered.svc-4", "build.triggered.svc-6"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_shutdown() {
        let bus = fast_bus();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = bus.subscribe("a.b", recorder(tx)).await.unwrap();

        bus.unsubscribe(id).await.unwrap();
        bus.publish("a.b", event("a.b")).await.unwrap();
        assert!(recv(&mut rx).await.is_none());

        assert!(matches!(
            bus.unsubscribe(id).await,
            Err(BusError::SubscriptionNotFound(_))
        ));

        bus.shutdown(Duration::from_millis(50)).await;
        assert!(matches!(bus.publish("a.b", event("a.b")).await, Err(BusError::Closed)));
    }

    #[tokio::test]
    async fn test_invalid_subject() {
        let bus = fast_bus();
        assert!(matches!(
            bus.publish("build..x", event("x")).await,
            Err(BusError::InvalidSubject(_))
        ));
    }
}
