//! Retry and timeout wrapper for store billing clients.
//!
//! Every store call is awaited under a per-call timeout and retried with
//! exponential backoff on transient failures (network errors, timeouts,
//! throttling, 5xx). Persistent transient failure surfaces as the last error,
//! which callers see as `StoreUnavailable`.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::domain::billing::{Store, StoreRef};
use crate::ports::{StoreBillingClient, StoreError, StoreSubscriptionState};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Add up to 25% jitter to each backoff.
    pub add_jitter: bool,
    /// Deadline for a single attempt.
    pub call_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    fn backoff_duration(&self, attempt: u32) -> Duration {
        let backoff =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff.min(self.max_backoff.as_millis() as f64) as u64;

        let mut duration = Duration::from_millis(backoff_ms);
        if self.add_jitter {
            let jitter = (backoff_ms as f64 * 0.25 * rand_jitter()) as u64;
            duration += Duration::from_millis(jitter);
        }
        duration
    }
}

/// Pseudo-random value in `[0, 1)` from the clock's sub-second nanos.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Runs `operation` under the configured timeout, retrying transient failures.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    store: Store,
    operation: &str,
    mut operation_fn: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        let result = match timeout(config.call_timeout, operation_fn()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(config.call_timeout.as_millis() as u64)),
        };

        match result {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(store = %store, operation, attempts = attempt + 1, "Store call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < config.max_retries => {
                let delay = config.backoff_duration(attempt);
                tracing::warn!(
                    store = %store,
                    operation,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying store call after transient error"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    tracing::error!(store = %store, operation, attempts = attempt + 1, error = %err, "Store call failed after retries");
                }
                return Err(err);
            }
        }
    }
}

/// Decorates any store client with [`with_retry`].
pub struct RetryingStoreClient {
    inner: Arc<dyn StoreBillingClient>,
    config: RetryConfig,
}

impl RetryingStoreClient {
    pub fn new(inner: Arc<dyn StoreBillingClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl StoreBillingClient for RetryingStoreClient {
    fn store(&self) -> Store {
        self.inner.store()
    }

    async fn validate_subscription(
        &self,
        store_product_id: Option<&str>,
        correlation: &StoreRef,
    ) -> Result<StoreSubscriptionState, StoreError> {
        with_retry(&self.config, self.store(), "validate_subscription", || {
            self.inner.validate_subscription(store_product_id, correlation)
        })
        .await
    }

    async fn cancel(
        &self,
        store_product_id: Option<&str>,
        correlation: &StoreRef,
        immediate: bool,
    ) -> Result<(), StoreError> {
        with_retry(&self.config, self.store(), "cancel", || {
            self.inner.cancel(store_product_id, correlation, immediate)
        })
        .await
    }

    async fn refund(
        &self,
        store_product_id: Option<&str>,
        correlation: &StoreRef,
        transaction_id: &str,
    ) -> Result<(), StoreError> {
        with_retry(&self.config, self.store(), "refund", || {
            self.inner.refund(store_product_id, correlation, transaction_id)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig::default()
            .with_initial_backoff(Duration::from_millis(1))
            .with_call_timeout(Duration::from_millis(50))
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let config = RetryConfig {
            add_jitter: false,
            max_backoff: Duration::from_millis(500),
            ..RetryConfig::default()
        };
        assert_eq!(config.backoff_duration(0), Duration::from_millis(200));
        assert_eq!(config.backoff_duration(1), Duration::from_millis(400));
        assert_eq!(config.backoff_duration(5), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(), Store::Mobile, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Unavailable("connection reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast(), Store::Web, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Rejected { status: 400, message: "bad".into() }) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out_and_give_up() {
        let config = fast().with_max_retries(1);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&config, Store::AppStore, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            }
        })
        .await;

        assert!(matches!(result, Err(StoreError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
