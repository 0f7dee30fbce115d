//! Per-provider request governance: a token-bucket rate limit paired with
//! a bounded-concurrency gate.
//!
//! Built on `governor`'s GCRA limiter rather than hand-rolling a bucket.
//! `qps < 1` is expressed as a period between single permits (governor
//! has no native sub-1-per-second rate), `qps >= 1` as a cell rate of
//! `round(qps)` per second with an optional burst override.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{Quota, RateLimiter as GovernorLimiter};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};

use crate::config::RateLimitConfig;
use crate::metrics::MetricsSink;

type GovernorInstance = GovernorLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

struct ProviderLimiter {
    limiter: GovernorInstance,
    semaphore: Arc<Semaphore>,
}

fn build_quota(config: &RateLimitConfig) -> Quota {
    let burst = config
        .burst
        .and_then(NonZeroU32::new)
        .unwrap_or_else(|| NonZeroU32::new(config.qps.ceil().max(1.0) as u32).unwrap());

    if config.qps < 1.0 {
        let period_ms = (1000.0 / config.qps.max(0.001)) as u64;
        Quota::with_period(std::time::Duration::from_millis(period_ms.max(1)))
            .unwrap()
            .allow_burst(burst)
    } else {
        Quota::per_second(NonZeroU32::new(config.qps.round().max(1.0) as u32).unwrap()).allow_burst(burst)
    }
}

impl ProviderLimiter {
    fn new(config: &RateLimitConfig) -> Self {
        Self {
            limiter: GovernorLimiter::direct(build_quota(config)),
            semaphore: Arc::new(Semaphore::new(config.concurrency as usize)),
        }
    }
}

/// A permit held for the lifetime of a single governed request; dropping
/// it frees the concurrency slot.
pub struct RateLimitPermit {
    _concurrency: OwnedSemaphorePermit,
}

pub struct RateLimiterRegistry {
    default_config: RateLimitConfig,
    configs: HashMap<String, RateLimitConfig>,
    limiters: RwLock<HashMap<String, Arc<ProviderLimiter>>>,
    metrics: Arc<dyn MetricsSink>,
}

const DEFAULT_QPS: f64 = 5.0;
const DEFAULT_CONCURRENCY: u32 = 4;

impl RateLimiterRegistry {
    pub fn new(configs: HashMap<String, RateLimitConfig>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            default_config: RateLimitConfig {
                qps: DEFAULT_QPS,
                concurrency: DEFAULT_CONCURRENCY,
                burst: None,
            },
            configs,
            limiters: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    async fn limiter_for(&self, provider: &str) -> Arc<ProviderLimiter> {
        {
            let read = self.limiters.read().await;
            if let Some(limiter) = read.get(provider) {
                return limiter.clone();
            }
        }
        let mut write = self.limiters.write().await;
        let config = self.configs.get(provider).copied().unwrap_or(self.default_config);
        write
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(ProviderLimiter::new(&config)))
            .clone()
    }

    /// Wait for both a token-bucket slot and a concurrency permit, in that
    /// order. Returns a permit that must be held for the request duration.
    pub async fn acquire(&self, provider: &str) -> RateLimitPermit {
        let limiter = self.limiter_for(provider).await;

        self.metrics.gauge(
            "rate_limiter_queue_depth",
            &[("provider", provider)],
            limiter.semaphore.available_permits() as f64,
        );

        limiter.limiter.until_ready().await;
        let permit = limiter
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore never closed");

        RateLimitPermit {
            _concurrency: permit,
        }
    }
}
