//! Exponential backoff with jitter and `Retry-After` honoring.
//!
//! A config struct describes the backoff curve; the executor wraps an
//! arbitrary fallible async operation in the retry loop, re-checking the
//! circuit breaker before every attempt so a breaker trip during backoff
//! stops the retry early instead of burning through remaining attempts.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::RetryConfig;
use crate::error::SdkError;

pub struct RetryHandler {
    config: RetryConfig,
}

impl RetryHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Full jitter: a random delay in `[0, backoff)`, where `backoff` grows
    /// geometrically from `base_delay_ms` and is capped at `max_delay_ms`.
    pub fn calculate_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(retry_after) = retry_after {
            return retry_after.min(Duration::from_millis(self.config.max_delay_ms));
        }

        let backoff_ms = (self.config.base_delay_ms as f64) * 2f64.powi(attempt as i32);
        let capped_ms = backoff_ms.min(self.config.max_delay_ms as f64);
        let jittered_ms = rand::thread_rng().gen_range(0.0..=capped_ms.max(1.0));
        Duration::from_millis(jittered_ms as u64)
    }

    /// Run `operation`, retrying on retryable errors up to `max_retries`
    /// additional times. Re-checks `breaker` before each attempt so an
    /// open breaker (tripped by a concurrent request) aborts the retry
    /// loop immediately rather than waiting out the backoff first.
    pub async fn execute<F, Fut, T>(
        &self,
        provider: &str,
        breaker: &CircuitBreakerRegistry,
        mut operation: F,
    ) -> Result<T, SdkError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SdkError>>,
    {
        let mut attempt = 0u32;
        let mut last_err: Option<SdkError> = None;
        loop {
            if !breaker.allow_request(provider).await {
                return Err(last_err.unwrap_or(SdkError::CircuitBreakerOpen {
                    provider: provider.to_string(),
                }));
            }

            match operation().await {
                Ok(value) => {
                    breaker.record_success(provider).await;
                    return Ok(value);
                }
                Err(err) => {
                    breaker.record_failure(provider).await;

                    if !err.is_retryable() || attempt >= self.config.max_retries {
                        return Err(err);
                    }

                    let delay = self.calculate_delay(attempt, err.retry_after());
                    tracing::warn!(
                        provider,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after failure"
                    );
                    last_err = Some(err);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn handler(max_retries: u32) -> RetryHandler {
        RetryHandler::new(RetryConfig {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 5,
            retryable_status_codes: vec![429, 500, 502, 503, 504],
        })
    }

    #[tokio::test]
    async fn succeeds_without_retrying_on_first_try() {
        let handler = handler(3);
        let breaker = CircuitBreakerRegistry::default();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<&str, SdkError> = handler
            .execute("github", &breaker, || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("ok")
                }
            })
            .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_retryable_errors_up_to_the_cap() {
        let handler = handler(2);
        let breaker = CircuitBreakerRegistry::default();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<&str, SdkError> = handler
            .execute("github", &breaker, || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(SdkError::ApiServer {
                        status: 503,
                        message: "unavailable".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_retryable_errors() {
        let handler = handler(3);
        let breaker = CircuitBreakerRegistry::default();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<&str, SdkError> = handler
            .execute("github", &breaker, || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(SdkError::ApiClient {
                        status: 404,
                        message: "not found".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn honors_retry_after_over_backoff_curve() {
        let handler = handler(1);
        assert_eq!(
            handler.calculate_delay(0, Some(Duration::from_millis(3))),
            Duration::from_millis(3)
        );
    }

    #[tokio::test]
    async fn stops_retrying_once_breaker_opens() {
        let handler = handler(5);
        let mut registry = CircuitBreakerRegistry::new(crate::circuit_breaker::CircuitBreakerConfig {
            threshold: 1,
            reset_timeout: Duration::from_secs(60),
        });
        registry.configure("github", crate::circuit_breaker::CircuitBreakerConfig {
            threshold: 1,
            reset_timeout: Duration::from_secs(60),
        });
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<&str, SdkError> = handler
            .execute("github", &registry, || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(SdkError::ApiServer {
                        status: 500,
                        message: "boom".into(),
                    })
                }
            })
            .await;
        // First call trips the breaker (threshold 1); the loop's next
        // iteration sees it open and aborts without a second call, but
        // surfaces the last observed error rather than a generic
        // circuit-open error.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match result {
            Err(SdkError::ApiServer { status, .. }) => assert_eq!(status, 500),
            other => panic!("expected the last ApiServer error, got {other:?}"),
        }
    }
}
