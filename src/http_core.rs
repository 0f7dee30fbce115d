//! Governed HTTP transport: every outbound call to a provider flows
//! through rate limiting, breaker gating, retry-with-backoff and
//! conditional-GET caching in that order.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::{HttpConfig, RateLimitConfig};
use crate::error::{SdkError, SdkResult};
use crate::etag_cache::EtagCache;
use crate::metrics::MetricsSink;
use crate::model::ETagEntry;
use crate::rate_limiter::RateLimiterRegistry;
use crate::retry::RetryHandler;

const USER_AGENT: &str = concat!("provider-ingest-sdk/", env!("CARGO_PKG_VERSION"));

pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub bearer_token: Option<SecretString>,
    pub headers: Vec<(String, String)>,
    pub json_body: Option<Value>,
    /// Exact cache key for conditional GET (already scoped by caller to
    /// `(user_id, provider, resource)`); `None` disables caching for this call.
    pub cache_key: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            bearer_token: None,
            headers: Vec::new(),
            json_body: None,
            cache_key: None,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            bearer_token: None,
            headers: Vec::new(),
            json_body: None,
            cache_key: None,
        }
    }

    pub fn bearer(mut self, token: SecretString) -> Self {
        self.bearer_token = Some(token);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.json_body = Some(body);
        self
    }

    pub fn cached(mut self, cache_key: impl Into<String>) -> Self {
        self.cache_key = Some(cache_key.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
    pub headers: HashMap<String, String>,
    pub from_cache: bool,
}

pub struct HttpCore {
    client: reqwest::Client,
    rate_limiter: Arc<RateLimiterRegistry>,
    breaker: Arc<CircuitBreakerRegistry>,
    retry: RetryHandler,
    etag_cache: Arc<EtagCache>,
    metrics: Arc<dyn MetricsSink>,
}

impl HttpCore {
    pub fn new(
        http_config: HttpConfig,
        rate_limits: HashMap<String, RateLimitConfig>,
        breaker: Arc<CircuitBreakerRegistry>,
        metrics: Arc<dyn MetricsSink>,
    ) -> SdkResult<Self> {
        let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
        if let Some(timeout_ms) = http_config.timeout_ms {
            builder = builder.timeout(std::time::Duration::from_millis(timeout_ms));
        }
        if http_config.keep_alive == Some(false) {
            builder = builder.pool_max_idle_per_host(0);
        }

        let client = builder
            .build()
            .map_err(|e| SdkError::Config(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            rate_limiter: Arc::new(RateLimiterRegistry::new(rate_limits, metrics.clone())),
            breaker,
            retry: RetryHandler::new(http_config.retry),
            etag_cache: Arc::new(EtagCache::default()),
            metrics,
        })
    }

    pub fn etag_cache(&self) -> &Arc<EtagCache> {
        &self.etag_cache
    }

    pub async fn request(&self, provider: &str, req: HttpRequest) -> SdkResult<HttpResponse> {
        let cached = req
            .cache_key
            .as_deref()
            .and_then(|key| self.etag_cache.get(key));

        let request_id = Uuid::new_v4().to_string();

        let result = self
            .retry
            .execute(provider, &self.breaker, || {
                self.send_once(provider, &req, &request_id, cached.as_ref())
            })
            .await;

        match result {
            Ok(response) => Ok(response),
            Err(err) => {
                self.metrics
                    .counter("http_requests_failed_total", &[("provider", provider)], 1);
                Err(err)
            }
        }
    }

    pub async fn get(&self, provider: &str, url: impl Into<String>) -> SdkResult<HttpResponse> {
        self.request(provider, HttpRequest::get(url)).await
    }

    async fn send_once(
        &self,
        provider: &str,
        req: &HttpRequest,
        request_id: &str,
        cached: Option<&ETagEntry>,
    ) -> SdkResult<HttpResponse> {
        let _permit = self.rate_limiter.acquire(provider).await;

        let mut builder = self
            .client
            .request(req.method.clone(), &req.url)
            .header("X-Request-ID", request_id)
            .header("Accept-Encoding", "gzip");

        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if let Some(token) = &req.bearer_token {
            builder = builder.bearer_auth(token.expose_secret());
        }
        if let (Some(cache_key), Some(entry)) = (&req.cache_key, cached) {
            let _ = cache_key;
            builder = builder.header("If-None-Match", &entry.etag);
        }
        if let Some(body) = &req.json_body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                SdkError::NetworkTimeout(e.to_string())
            } else {
                SdkError::ApiServer {
                    status: 0,
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_lowercase(), v.to_string())))
            .collect();

        if status == StatusCode::NOT_MODIFIED {
            if let Some(entry) = cached {
                self.metrics
                    .counter("http_cache_hits_total", &[("provider", provider)], 1);
                return Ok(HttpResponse {
                    status: 304,
                    body: entry.payload.clone(),
                    headers,
                    from_cache: true,
                });
            }
            // 304 with no cached entry to serve is a caching contract
            // violation upstream; treat it as an empty success.
            return Ok(HttpResponse {
                status: 304,
                body: Value::Null,
                headers,
                from_cache: false,
            });
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = headers.get("retry-after").and_then(|v| parse_retry_after(v));
            return Err(SdkError::RateLimit { retry_after });
        }

        if status.is_server_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(SdkError::ApiServer {
                status: status.as_u16(),
                message,
            });
        }

        if status.is_client_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(SdkError::ApiClient {
                status: status.as_u16(),
                message,
            });
        }

        let etag = headers.get("etag").cloned();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if let (Some(cache_key), Some(etag)) = (&req.cache_key, etag) {
            self.etag_cache.put(
                cache_key.clone(),
                ETagEntry {
                    etag,
                    payload: body.clone(),
                    timestamp: chrono::Utc::now(),
                },
            );
        }

        Ok(HttpResponse {
            status: status.as_u16(),
            body,
            headers,
            from_cache: false,
        })
    }
}

/// Parses either the delta-seconds or HTTP-date form of `Retry-After`.
fn parse_retry_after(value: &str) -> Option<std::time::Duration> {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(std::time::Duration::from_secs(seconds));
    }
    let target = chrono::DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let delta = target.with_timezone(&chrono::Utc) - chrono::Utc::now();
    delta.to_std().ok()
}
