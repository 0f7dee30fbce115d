//! Provider adapter protocol and the shared connector lifecycle:
//! `connect` / `handleCallback` / `fetch` / `disconnect`, and the
//! access-token algorithm with refresh single-flighting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::{FutureExt, Shared};
use tokio::sync::Mutex;

use crate::auth_core::AuthCore;
use crate::distributed_lock::{lock_key, DistributedRefreshLock, DEFAULT_LOCK_TTL, DEFAULT_WAIT_TIMEOUT};
use crate::error::{SdkError, SdkResult};
use crate::http_core::HttpCore;
use crate::model::{NormalizedItem, TokenSet};
use crate::normalizer::Normalizer;
use crate::token_store::TokenStore;

/// Context a `ProviderAdapter` needs to make its own governed HTTP calls.
pub struct FetchContext<'a> {
    pub user_id: &'a str,
    pub access_token: String,
    pub http: Arc<HttpCore>,
    pub cursor: Option<String>,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Key used to look up rate limits, the circuit breaker, and the
    /// normalizer's mapper registry. Usually the connector's own name.
    fn provider_key(&self) -> &str;

    /// Fetch one page (or the whole resource, for adapters without
    /// pagination) of raw provider payloads.
    async fn fetch(&self, ctx: &FetchContext<'_>) -> SdkResult<Vec<serde_json::Value>>;

    /// Adapters with no OAuth surface (e.g. a public feed reader) return
    /// `false` and `BaseConnector::fetch` skips the token lifecycle.
    fn requires_auth(&self) -> bool {
        true
    }
}

type RefreshFuture = Shared<futures::future::BoxFuture<'static, Result<TokenSet, SdkError>>>;

/// How long a resolved refresh future is kept in the single-flight map
/// after completion, so callers that arrive just as it finishes still
/// coalesce onto it instead of starting a redundant refresh.
const INFLIGHT_RETENTION: Duration = Duration::from_secs(1);

pub struct BaseConnector {
    adapter: Arc<dyn ProviderAdapter>,
    token_store: Arc<TokenStore>,
    auth_core: Arc<AuthCore>,
    lock: Arc<dyn DistributedRefreshLock>,
    http: Arc<HttpCore>,
    normalizer: Arc<Normalizer>,
    pre_refresh_margin: chrono::Duration,
    inflight: Arc<Mutex<HashMap<String, (u64, RefreshFuture)>>>,
    inflight_generation: AtomicU64,
}

impl BaseConnector {
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        token_store: Arc<TokenStore>,
        auth_core: Arc<AuthCore>,
        lock: Arc<dyn DistributedRefreshLock>,
        http: Arc<HttpCore>,
        normalizer: Arc<Normalizer>,
        pre_refresh_margin_minutes: u32,
    ) -> Self {
        Self {
            adapter,
            token_store,
            auth_core,
            lock,
            http,
            normalizer,
            pre_refresh_margin: chrono::Duration::minutes(pre_refresh_margin_minutes as i64),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            inflight_generation: AtomicU64::new(0),
        }
    }

    fn provider(&self) -> &str {
        self.adapter.provider_key()
    }

    pub async fn connect(&self, user_id: &str) -> SdkResult<String> {
        let (url, _state) = self.auth_core.create_auth_url(self.provider(), user_id).await?;
        Ok(url)
    }

    pub async fn handle_callback(&self, code: &str, state: &str) -> SdkResult<String> {
        let (user_id, token_set) = self.auth_core.exchange_code(self.provider(), code, state).await?;
        self.token_store.set(&user_id, self.provider(), token_set).await?;
        Ok(user_id)
    }

    pub async fn disconnect(&self, user_id: &str) -> SdkResult<()> {
        if let Some(token) = self.token_store.get(user_id, self.provider(), true).await? {
            self.auth_core.revoke_token(self.provider(), &token.access_token).await;
        }
        self.token_store.delete(user_id, self.provider()).await
    }

    /// Serve the stored token unless it's within the pre-refresh margin
    /// of expiry, in which case refresh first (deduplicated across
    /// concurrent callers).
    pub async fn get_access_token(&self, user_id: &str) -> SdkResult<String> {
        let stored = self
            .token_store
            .get(user_id, self.provider(), true)
            .await?
            .ok_or_else(|| SdkError::TokenNotFound {
                user_id: user_id.to_string(),
                provider: self.provider().to_string(),
            })?;

        let Some(expires_at) = stored.expires_at else {
            return Ok(stored.access_token);
        };

        if Utc::now() + self.pre_refresh_margin < expires_at {
            return Ok(stored.access_token);
        }

        let refreshed = self.refresh_with_dedup(user_id, stored).await?;
        Ok(refreshed.access_token)
    }

    /// Local in-process single-flight: concurrent callers for the same
    /// `(user_id, provider)` share one `execute_refresh` future. The
    /// entry is kept in the map for a short grace period after it
    /// resolves so callers arriving right as it finishes still coalesce
    /// onto the same result instead of kicking off a redundant refresh.
    async fn refresh_with_dedup(&self, user_id: &str, current: TokenSet) -> SdkResult<TokenSet> {
        let key = format!("{user_id}:{}", self.provider());

        let (generation, shared) = {
            let mut inflight = self.inflight.lock().await;
            if let Some((generation, existing)) = inflight.get(&key) {
                (*generation, existing.clone())
            } else {
                let user_id_owned = user_id.to_string();
                let this = self.clone_refs();
                let future: futures::future::BoxFuture<'static, Result<TokenSet, SdkError>> =
                    async move { this.execute_refresh(&user_id_owned, current).await }.boxed();
                let shared = future.shared();
                let generation = self.inflight_generation.fetch_add(1, Ordering::SeqCst);
                inflight.insert(key.clone(), (generation, shared.clone()));
                (generation, shared)
            }
        };

        let result = shared.await;

        let inflight = self.inflight.clone();
        tokio::spawn(async move {
            tokio::time::sleep(INFLIGHT_RETENTION).await;
            let mut inflight = inflight.lock().await;
            if matches!(inflight.get(&key), Some((g, _)) if *g == generation) {
                inflight.remove(&key);
            }
        });

        result
    }

    /// Cheap `Arc`-cloned view of the collaborators a refresh needs, so
    /// the single-flight future doesn't borrow `self`.
    fn clone_refs(&self) -> RefreshExecutor {
        RefreshExecutor {
            provider: self.provider().to_string(),
            token_store: self.token_store.clone(),
            auth_core: self.auth_core.clone(),
            lock: self.lock.clone(),
        }
    }

    pub async fn fetch(&self, user_id: &str, cursor: Option<String>) -> SdkResult<Vec<NormalizedItem>> {
        let access_token = if self.adapter.requires_auth() {
            self.get_access_token(user_id).await?
        } else {
            String::new()
        };

        let ctx = FetchContext {
            user_id,
            access_token,
            http: self.http.clone(),
            cursor,
        };

        let raw_items = self.adapter.fetch(&ctx).await?;
        self.normalizer.normalize_batch(self.provider(), &raw_items, user_id)
    }
}

/// Collaborators needed by a refresh, cloned out of `BaseConnector` so the
/// single-flight future is `'static` and doesn't hold a borrow of `self`.
#[derive(Clone)]
struct RefreshExecutor {
    provider: String,
    token_store: Arc<TokenStore>,
    auth_core: Arc<AuthCore>,
    lock: Arc<dyn DistributedRefreshLock>,
}

impl RefreshExecutor {
    async fn execute_refresh(&self, user_id: &str, current: TokenSet) -> Result<TokenSet, SdkError> {
        if !current.has_refresh_token() {
            return Err(SdkError::TokenExpired {
                user_id: user_id.to_string(),
                provider: self.provider.clone(),
            });
        }

        let key = lock_key(user_id, &self.provider);

        if self.lock.try_acquire(&key, DEFAULT_LOCK_TTL).await? {
            let result = self
                .auth_core
                .refresh_token(&self.provider, current.refresh_token.as_deref().unwrap_or_default())
                .await;
            self.lock.release(&key).await?;

            return match result {
                Ok(new_set) => {
                    self.token_store.update(user_id, &self.provider, new_set.clone()).await?;
                    Ok(new_set)
                }
                Err(e) => {
                    if is_invalid_grant(&e) {
                        self.token_store.delete(user_id, &self.provider).await?;
                        Err(SdkError::TokenExpired {
                            user_id: user_id.to_string(),
                            provider: self.provider.clone(),
                        })
                    } else {
                        Err(SdkError::TokenRefresh {
                            user_id: user_id.to_string(),
                            provider: self.provider.clone(),
                            reason: e.to_string(),
                        })
                    }
                }
            };
        }

        // Another process holds the lock; wait for it to finish and read
        // back whatever it produced rather than refreshing ourselves too.
        let released = self.lock.wait_for_release(&key, DEFAULT_WAIT_TIMEOUT).await?;
        if !released {
            return Err(SdkError::TokenRefresh {
                user_id: user_id.to_string(),
                provider: self.provider.clone(),
                reason: "timed out waiting for a concurrent refresh to finish".to_string(),
            });
        }

        match self.token_store.get(user_id, &self.provider, false).await? {
            Some(refreshed) => Ok(refreshed),
            None => Err(SdkError::TokenRefresh {
                user_id: user_id.to_string(),
                provider: self.provider.clone(),
                reason: "concurrent refresh did not produce a valid token".to_string(),
            }),
        }
    }
}

fn is_invalid_grant(err: &SdkError) -> bool {
    matches!(err, SdkError::OAuth(msg) if msg.contains("invalid_grant"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_core::AuthCore;
    use crate::circuit_breaker::CircuitBreakerRegistry;
    use crate::config::HttpConfig;
    use crate::crypto::Encryptor;
    use crate::distributed_lock::LocalOnlyRefreshLock;
    use crate::token_store::{MemoryTokenStore, TokenStoreOptions};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubAdapter {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ProviderAdapter for StubAdapter {
        fn provider_key(&self) -> &str {
            "stub"
        }

        async fn fetch(&self, ctx: &FetchContext<'_>) -> SdkResult<Vec<serde_json::Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(!ctx.access_token.is_empty());
            Ok(vec![serde_json::json!({"id": "1"})])
        }
    }

    fn connector() -> (BaseConnector, Arc<TokenStore>) {
        let token_store = Arc::new(TokenStore::new(
            Arc::new(MemoryTokenStore::new()),
            Some(Arc::new(Encryptor::from_passphrase("test"))),
            TokenStoreOptions::default(),
        ));
        let auth_core = Arc::new(AuthCore::new(HashMap::new()));
        let lock = Arc::new(LocalOnlyRefreshLock::new());
        let http = Arc::new(
            HttpCore::new(
                HttpConfig::default(),
                HashMap::new(),
                Arc::new(CircuitBreakerRegistry::default()),
                Arc::new(crate::metrics::NoopMetricsSink),
            )
            .unwrap(),
        );
        let normalizer = Normalizer::new();
        struct PassthroughMapper;
        impl crate::normalizer::Mapper for PassthroughMapper {
            fn map(&self, raw: &serde_json::Value, user_id: &str) -> SdkResult<NormalizedItem> {
                let external_id = raw["id"].as_str().unwrap().to_string();
                Ok(NormalizedItem {
                    id: NormalizedItem::derive_id("stub", &external_id, user_id),
                    source: "stub".to_string(),
                    external_id,
                    user_id: user_id.to_string(),
                    title: None,
                    body_text: None,
                    url: None,
                    author: None,
                    published_at: None,
                    metadata: None,
                })
            }
        }
        normalizer.register("stub", Arc::new(PassthroughMapper));

        let adapter = Arc::new(StubAdapter {
            calls: Arc::new(AtomicU32::new(0)),
        });

        (
            BaseConnector::new(adapter, token_store.clone(), auth_core, lock, http, Arc::new(normalizer), 5),
            token_store,
        )
    }

    #[tokio::test]
    async fn get_access_token_errors_when_nothing_stored() {
        let (connector, _store) = connector();
        let result = connector.get_access_token("user-1").await;
        assert!(matches!(result, Err(SdkError::TokenNotFound { .. })));
    }

    #[tokio::test]
    async fn get_access_token_returns_stored_token_when_fresh() {
        let (connector, store) = connector();
        store
            .set(
                "user-1",
                "stub",
                TokenSet {
                    access_token: "tok-abc".to_string(),
                    refresh_token: None,
                    expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
                    scope: None,
                    token_type: None,
                    id_token: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(connector.get_access_token("user-1").await.unwrap(), "tok-abc");
    }

    #[tokio::test]
    async fn get_access_token_without_refresh_token_fails_when_near_expiry() {
        let (connector, store) = connector();
        store
            .set(
                "user-1",
                "stub",
                TokenSet {
                    access_token: "tok-abc".to_string(),
                    refresh_token: None,
                    expires_at: Some(Utc::now() + chrono::Duration::seconds(10)),
                    scope: None,
                    token_type: None,
                    id_token: None,
                },
            )
            .await
            .unwrap();
        let result = connector.get_access_token("user-1").await;
        assert!(matches!(result, Err(SdkError::TokenExpired { .. })));
    }

    #[tokio::test]
    async fn fetch_normalizes_adapter_output() {
        let (connector, store) = connector();
        store
            .set(
                "user-1",
                "stub",
                TokenSet {
                    access_token: "tok-abc".to_string(),
                    refresh_token: None,
                    expires_at: None,
                    scope: None,
                    token_type: None,
                    id_token: None,
                },
            )
            .await
            .unwrap();
        let items = connector.fetch("user-1", None).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].external_id, "1");
    }
}
