//! SDK configuration schema (recognized options).
//!
//! Deep semantic validation of a given provider's business rules is an
//! external collaborator's job; `validate()` here only guards against
//! structurally broken configuration reaching the core (missing provider
//! credentials, inverted retry bounds, non-positive rate limits).

use std::collections::HashMap;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::SdkError;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TokenStoreBackendKind {
    #[serde(rename = "memory")]
    Memory,
    #[serde(rename = "durable-kv")]
    DurableKv,
    #[serde(rename = "relational")]
    Relational,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionConfig {
    /// 64 hex characters = 32 raw bytes, AES-256 key material.
    pub key: SecretString,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
}

fn default_algorithm() -> String {
    "aes-256-gcm".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStoreConfig {
    pub backend: TokenStoreBackendKind,
    pub url: Option<String>,
    pub encryption: Option<EncryptionConfig>,
    #[serde(default = "default_pre_refresh_margin")]
    pub pre_refresh_margin_minutes: u32,
    #[serde(default = "default_expired_buffer")]
    pub expired_token_buffer_minutes: u32,
    pub ttl_seconds: Option<u64>,
}

fn default_pre_refresh_margin() -> u32 {
    5
}
fn default_expired_buffer() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_retryable_status_codes")]
    pub retryable_status_codes: Vec<u16>,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_retryable_status_codes() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            retryable_status_codes: default_retryable_status_codes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryConfig,
    pub keep_alive: Option<bool>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub qps: f64,
    pub concurrency: u32,
    pub burst: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthMethod {
    ClientSecretPost,
    ClientSecretBasic,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub client_id: String,
    pub client_secret: Option<SecretString>,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub revocation_endpoint: Option<String>,
    pub discovery_url: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub redirect_uri: String,
    #[serde(default = "default_true")]
    pub use_pkce: bool,
    /// Force a single auth method; `None` means try post then fall back to basic.
    #[serde(default)]
    pub forced_auth_method: Option<AuthMethod>,
    /// Treat this provider as OIDC (mint + validate a nonce). Only ever
    /// true for providers whose endpoints came from discovery.
    #[serde(default)]
    pub oidc: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub port: Option<u16>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdkConfig {
    pub token_store: TokenStoreConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitConfig>,
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SdkConfig {
    /// Structural validation only — see module docs.
    pub fn validate(&self) -> Result<(), SdkError> {
        if self.providers.is_empty() {
            return Err(SdkError::Config(
                "at least one provider must be configured".into(),
            ));
        }

        if let Some(enc) = &self.token_store.encryption {
            use secrecy::ExposeSecret;
            let key = enc.key.expose_secret();
            if key.len() != 64 || hex::decode(key).is_err() {
                return Err(SdkError::Config(
                    "token_store.encryption.key must be 64 hex characters (32 bytes)".into(),
                ));
            }
            if enc.algorithm != "aes-256-gcm" {
                return Err(SdkError::Config(format!(
                    "unsupported encryption algorithm: {}",
                    enc.algorithm
                )));
            }
        }

        if !(1..=60).contains(&self.token_store.pre_refresh_margin_minutes) {
            return Err(SdkError::Config(
                "preRefreshMarginMinutes must be in 1..=60".into(),
            ));
        }
        if !(1..=60).contains(&self.token_store.expired_token_buffer_minutes) {
            return Err(SdkError::Config(
                "expiredTokenBufferMinutes must be in 1..=60".into(),
            ));
        }

        if self.http.retry.max_delay_ms < self.http.retry.base_delay_ms {
            return Err(SdkError::Config(
                "http.retry.maxDelay must be >= baseDelay".into(),
            ));
        }
        if self.http.retry.max_retries > 10 {
            return Err(SdkError::Config(
                "http.retry.maxRetries must be <= 10".into(),
            ));
        }

        for (provider, rl) in &self.rate_limits {
            if rl.qps <= 0.0 {
                return Err(SdkError::Config(format!(
                    "rateLimits.{provider}.qps must be > 0"
                )));
            }
            if rl.concurrency == 0 {
                return Err(SdkError::Config(format!(
                    "rateLimits.{provider}.concurrency must be > 0"
                )));
            }
        }

        for (name, provider) in &self.providers {
            if provider.client_id.is_empty() {
                return Err(SdkError::Config(format!(
                    "providers.{name}.clientId must not be empty"
                )));
            }
            if provider.discovery_url.is_none()
                && (provider.authorization_endpoint.is_none() || provider.token_endpoint.is_none())
            {
                return Err(SdkError::Config(format!(
                    "providers.{name} must supply either discoveryUrl or both authorizationEndpoint and tokenEndpoint"
                )));
            }
            if let Some(port) = self.metrics.port {
                if !(1024..=65535).contains(&port) {
                    return Err(SdkError::Config("metrics.port must be in 1024..=65535".into()));
                }
            }
            if let Some(path) = &self.metrics.path {
                if !path.starts_with('/') {
                    return Err(SdkError::Config("metrics.path must start with '/'".into()));
                }
            }
        }

        Ok(())
    }
}
