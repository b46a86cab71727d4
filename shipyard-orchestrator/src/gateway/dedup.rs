//! Short-lived cache of webhook delivery ids

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Delivery keys seen within the last `ttl`.
///
/// `claim` checks and records in one step, so two concurrent deliveries of
/// the same key cannot both be admitted.
#[derive(Debug)]
pub struct DeliveryDedup {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl DeliveryDedup {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record `key`; returns false if it was already claimed and has not expired
    pub async fn claim(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().await;

        if let Some(claimed_at) = seen.get(key)
            && now.duration_since(*claimed_at) < self.ttl
        {
            return false;
        }

        seen.insert(key.to_string(), now);
        true
    }

    /// Forget `key` so the next delivery is processed again
    pub async fn release(&self, key: &str) {
        self.seen.lock().await.remove(key);
    }

    /// Drop expired keys; returns how many were removed
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut seen = self.seen.lock().await;
        let before = seen.len();
        seen.retain(|_, claimed_at| now.duration_since(*claimed_at) < self.ttl);
        before - seen.len()
    }

    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }
}
