//! Top-level façade: wires every component together behind a single
//! handle an embedding application drives through `connect` /
//! `handleCallback` / `fetch` / `disconnect`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::sync::RwLock;

use crate::auth_core::AuthCore;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::{SdkConfig, TokenStoreBackendKind};
use crate::connector::{BaseConnector, ProviderAdapter};
use crate::crypto::Encryptor;
use crate::distributed_lock::{DistributedRefreshLock, LocalOnlyRefreshLock, PostgresRefreshLock};
use crate::error::{SdkError, SdkResult};
use crate::http_core::HttpCore;
use crate::metrics::{MetricsSink, NoopMetricsSink, TracingMetricsSink};
use crate::model::NormalizedItem;
use crate::normalizer::{Mapper, Normalizer};
use crate::token_store::{KvTokenStore, MemoryTokenStore, PostgresTokenStore, TokenStore, TokenStoreBackend, TokenStoreOptions};

const PKCE_SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(60);

/// Snapshot surfaced by [`Sdk::health`] — the distributed lock's
/// degraded-mode flag is the one thing worth exposing proactively.
#[derive(Debug, Clone)]
pub struct SdkHealth {
    pub refresh_lock_degraded: bool,
    pub registered_connectors: usize,
    pub cached_etags: usize,
}

pub struct Sdk {
    connectors: RwLock<HashMap<String, Arc<BaseConnector>>>,
    auth_core: Arc<AuthCore>,
    token_store: Arc<TokenStore>,
    http: Arc<HttpCore>,
    lock: Arc<dyn DistributedRefreshLock>,
    normalizer: Arc<Normalizer>,
    metrics: Arc<dyn MetricsSink>,
    pre_refresh_margin_minutes: u32,
    _pkce_sweeper: tokio::task::JoinHandle<()>,
}

impl Sdk {
    pub async fn init(config: SdkConfig) -> SdkResult<Self> {
        config.validate()?;

        let metrics: Arc<dyn MetricsSink> = if config.metrics.enabled {
            Arc::new(TracingMetricsSink)
        } else {
            Arc::new(NoopMetricsSink)
        };

        let encryptor = config
            .token_store
            .encryption
            .as_ref()
            .map(|enc| {
                use secrecy::ExposeSecret;
                Encryptor::from_hex(enc.key.expose_secret()).map(Arc::new)
            })
            .transpose()
            .map_err(SdkError::Config)?;

        let (backend, lock): (Arc<dyn TokenStoreBackend>, Arc<dyn DistributedRefreshLock>) =
            match config.token_store.backend {
                TokenStoreBackendKind::Memory => (
                    Arc::new(MemoryTokenStore::new()),
                    Arc::new(LocalOnlyRefreshLock::new()),
                ),
                TokenStoreBackendKind::Relational => {
                    let url = config.token_store.url.as_deref().ok_or_else(|| {
                        SdkError::Config("token_store.url required for relational backend".into())
                    })?;
                    let pool = sqlx::PgPool::connect(url)
                        .await
                        .map_err(|e| SdkError::Storage(e.to_string()))?;
                    let store = PostgresTokenStore::new(pool.clone());
                    store.ensure_schema().await?;
                    let lock = PostgresRefreshLock::new(pool);
                    lock.ensure_schema().await?;
                    (Arc::new(store), Arc::new(lock))
                }
                TokenStoreBackendKind::DurableKv => {
                    let url = config.token_store.url.as_deref().ok_or_else(|| {
                        SdkError::Config("token_store.url required for durable-kv backend".into())
                    })?;
                    let pool = sqlx::PgPool::connect(url)
                        .await
                        .map_err(|e| SdkError::Storage(e.to_string()))?;
                    let store = KvTokenStore::new(pool.clone());
                    store.ensure_schema().await?;
                    let lock = PostgresRefreshLock::new(pool);
                    lock.ensure_schema().await?;
                    (Arc::new(store), Arc::new(lock))
                }
            };

        let token_store = Arc::new(
            TokenStore::new(
                backend,
                encryptor,
                TokenStoreOptions {
                    expired_token_buffer_minutes: config.token_store.expired_token_buffer_minutes,
                    default_ttl: config
                        .token_store
                        .ttl_seconds
                        .map(StdDuration::from_secs)
                        .unwrap_or(StdDuration::from_secs(3600)),
                },
            )
            .with_metrics(metrics.clone()),
        );

        let breaker = Arc::new(CircuitBreakerRegistry::default());
        let http = Arc::new(HttpCore::new(
            config.http.clone(),
            config.rate_limits.clone(),
            breaker,
            metrics.clone(),
        )?);

        let auth_core = Arc::new(AuthCore::new(config.providers.clone()));
        auth_core.initialize().await?;

        let sweeper_auth = auth_core.clone();
        let pkce_sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PKCE_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                sweeper_auth.sweep_expired_pkce().await;
            }
        });

        Ok(Self {
            connectors: RwLock::new(HashMap::new()),
            auth_core,
            token_store,
            http,
            lock,
            normalizer: Arc::new(Normalizer::new()),
            metrics,
            pre_refresh_margin_minutes: config.token_store.pre_refresh_margin_minutes,
            _pkce_sweeper: pkce_sweeper,
        })
    }

    /// Register a provider adapter under `provider_key`, with the mapper
    /// the normalizer should use for its raw payloads.
    pub async fn register_connector(
        &self,
        provider_key: &str,
        adapter: Arc<dyn ProviderAdapter>,
        mapper: Arc<dyn Mapper>,
    ) {
        self.normalizer.register(provider_key, mapper);

        let connector = Arc::new(BaseConnector::new(
            adapter,
            self.token_store.clone(),
            self.auth_core.clone(),
            self.lock.clone(),
            self.http.clone(),
            self.normalizer.clone(),
            self.pre_refresh_margin_minutes,
        ));
        self.connectors.write().await.insert(provider_key.to_string(), connector);
    }

    async fn connector(&self, provider_key: &str) -> SdkResult<Arc<BaseConnector>> {
        self.connectors
            .read()
            .await
            .get(provider_key)
            .cloned()
            .ok_or_else(|| SdkError::Config(format!("no connector registered for {provider_key}")))
    }

    pub async fn connect(&self, provider_key: &str, user_id: &str) -> SdkResult<String> {
        self.connector(provider_key).await?.connect(user_id).await
    }

    pub async fn handle_callback(&self, provider_key: &str, code: &str, state: &str) -> SdkResult<String> {
        self.connector(provider_key).await?.handle_callback(code, state).await
    }

    pub async fn fetch(
        &self,
        provider_key: &str,
        user_id: &str,
        cursor: Option<String>,
    ) -> SdkResult<Vec<NormalizedItem>> {
        self.connector(provider_key).await?.fetch(user_id, cursor).await
    }

    pub async fn disconnect(&self, provider_key: &str, user_id: &str) -> SdkResult<()> {
        self.connector(provider_key).await?.disconnect(user_id).await
    }

    pub async fn health(&self) -> SdkHealth {
        SdkHealth {
            refresh_lock_degraded: self.lock.is_degraded(),
            registered_connectors: self.connectors.read().await.len(),
            cached_etags: self.http.etag_cache().len(),
        }
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }
}

impl Drop for Sdk {
    fn drop(&mut self) {
        self._pkce_sweeper.abort();
    }
}
