//! Per-provider failure-tripped circuit breaker.
//!
//! An atomic failure counter plus a cooldown deadline, registered one per
//! provider. Deliberately has no true half-open probe state: once the
//! cooldown elapses the next `allow_request` call simply resets the
//! counter and lets traffic back through. A true half-open with a single
//! probe request is a reasonable future refinement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock as StdRwLock;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

const DEFAULT_THRESHOLD: u32 = 5;
const DEFAULT_RESET: Duration = Duration::from_secs(60);

struct Breaker {
    failure_count: AtomicU32,
    opened_at: StdRwLock<Option<Instant>>,
    threshold: u32,
    reset_timeout: Duration,
}

impl Breaker {
    fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_count: AtomicU32::new(0),
            opened_at: StdRwLock::new(None),
            threshold,
            reset_timeout,
        }
    }

    fn allow_request(&self) -> bool {
        let opened_at = *self.opened_at.read().unwrap();
        match opened_at {
            None => true,
            Some(at) if at.elapsed() >= self.reset_timeout => {
                *self.opened_at.write().unwrap() = None;
                self.failure_count.store(0, Ordering::SeqCst);
                true
            }
            Some(_) => false,
        }
    }

    fn record_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        *self.opened_at.write().unwrap() = None;
    }

    fn record_failure(&self) {
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.threshold {
            let mut opened_at = self.opened_at.write().unwrap();
            if opened_at.is_none() {
                *opened_at = Some(Instant::now());
            }
        }
    }

    fn is_open(&self) -> bool {
        self.opened_at.read().unwrap().is_some()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            reset_timeout: DEFAULT_RESET,
        }
    }
}

/// Registry of one breaker per provider, created lazily on first use with
/// a shared default config (a per-provider override can be layered in by
/// constructing breakers up front via [`CircuitBreakerRegistry::configure`]).
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    breakers: RwLock<HashMap<String, Breaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            overrides: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Set a non-default threshold/reset timeout for a specific provider.
    pub fn configure(&mut self, provider: &str, config: CircuitBreakerConfig) {
        self.overrides.insert(provider.to_string(), config);
    }

    async fn get_or_create(&self, provider: &str) -> tokio::sync::RwLockReadGuard<'_, HashMap<String, Breaker>> {
        {
            let read = self.breakers.read().await;
            if read.contains_key(provider) {
                drop(read);
                return self.breakers.read().await;
            }
        }
        let mut write = self.breakers.write().await;
        write.entry(provider.to_string()).or_insert_with(|| {
            let config = self.overrides.get(provider).copied().unwrap_or(self.default_config);
            Breaker::new(config.threshold, config.reset_timeout)
        });
        drop(write);
        self.breakers.read().await
    }

    pub async fn allow_request(&self, provider: &str) -> bool {
        let guard = self.get_or_create(provider).await;
        guard.get(provider).map(Breaker::allow_request).unwrap_or(true)
    }

    pub async fn record_success(&self, provider: &str) {
        let guard = self.get_or_create(provider).await;
        if let Some(breaker) = guard.get(provider) {
            breaker.record_success();
        }
    }

    pub async fn record_failure(&self, provider: &str) {
        let guard = self.get_or_create(provider).await;
        if let Some(breaker) = guard.get(provider) {
            breaker.record_failure();
        }
    }

    pub async fn is_open(&self, provider: &str) -> bool {
        let guard = self.get_or_create(provider).await;
        guard.get(provider).map(Breaker::is_open).unwrap_or(false)
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
