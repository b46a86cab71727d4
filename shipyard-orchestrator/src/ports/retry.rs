//! Bounded retry with exponential backoff for port calls

use std::future::Future;
use std::time::Duration;

use super::PortError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Deadline for each individual attempt
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from `base_delay` and capped
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Longest a call run under this policy can take, timeouts and backoff included
    pub fn worst_case(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let waits: Duration = (1..attempts).map(|attempt| self.delay_after(attempt)).sum();
        self.call_timeout.saturating_mul(attempts) + waits
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Each attempt is bounded by `call_timeout`. Dropping the returned future
    /// cancels the in-flight attempt.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, PortError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PortError>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(PortError::Timeout(self.call_timeout)),
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!("{} succeeded after {} attempt(s)", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.max_attempts => {
                    tracing::error!(
                        "{} failed after {} attempts: {}",
                        operation,
                        attempt,
                        e
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        operation,
                        attempt,
                        self.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            call_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(10), Duration::from_secs(30));
        assert_eq!(policy.delay_after(64), Duration::from_secs(30));
        // 3 x 30s timeouts plus 1s and 2s of backoff
        assert_eq!(policy.worst_case(), Duration::from_secs(93));
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = fast_policy()
            .run("trigger build", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(PortError::Transport("connection reset".to_string()))
                    } else {
                        Ok("build-42")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "build-42");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = fast_policy()
            .run("sync", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(PortError::Status {
                        system: "argocd",
                        status: 502,
                        message: "bad gateway".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(PortError::Status { status: 502, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = fast_policy()
            .run("status", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(PortError::NotFound("build-9".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(PortError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_time_bounded() {
        let result: Result<(), _> = fast_policy()
            .run("hang", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(PortError::Timeout(_))));
    }
}
