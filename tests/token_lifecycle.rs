//! End-to-end expired-token auto-refresh on fetch: a stored token past
//! its pre-refresh margin triggers a refresh against the OAuth token
//! endpoint before the adapter's own request goes out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use provider_ingest_sdk::auth_core::AuthCore;
use provider_ingest_sdk::circuit_breaker::CircuitBreakerRegistry;
use provider_ingest_sdk::config::{HttpConfig, ProviderConfig};
use provider_ingest_sdk::connector::{BaseConnector, FetchContext, ProviderAdapter};
use provider_ingest_sdk::crypto::Encryptor;
use provider_ingest_sdk::distributed_lock::LocalOnlyRefreshLock;
use provider_ingest_sdk::http_core::HttpCore;
use provider_ingest_sdk::metrics::NoopMetricsSink;
use provider_ingest_sdk::normalizer::{Mapper, Normalizer};
use provider_ingest_sdk::token_store::{MemoryTokenStore, TokenStore, TokenStoreOptions};
use provider_ingest_sdk::{NormalizedItem, SdkResult, TokenSet};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct EchoAdapter {
    resource_url: String,
}

#[async_trait]
impl ProviderAdapter for EchoAdapter {
    fn provider_key(&self) -> &str {
        "code-hosting"
    }

    async fn fetch(&self, ctx: &FetchContext<'_>) -> SdkResult<Vec<serde_json::Value>> {
        let request = provider_ingest_sdk::http_core::HttpRequest::get(self.resource_url.clone())
            .bearer(secrecy::SecretString::from(ctx.access_token.clone()));
        let response = ctx.http.request(self.provider_key(), request).await?;
        Ok(response.body.as_array().cloned().unwrap_or_default())
    }
}

struct EchoMapper;
impl Mapper for EchoMapper {
    fn map(&self, raw: &serde_json::Value, user_id: &str) -> SdkResult<NormalizedItem> {
        let external_id = raw["id"].as_str().unwrap_or_default().to_string();
        Ok(NormalizedItem {
            id: NormalizedItem::derive_id("code-hosting", &external_id, user_id),
            source: "code-hosting".to_string(),
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

#[tokio::test]
async fn fetch_refreshes_an_expired_token_before_calling_the_adapter() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "refreshed-token",
            "refresh_token": "still-valid-refresh-token",
            "expires_in": 3600,
            "token_type": "Bearer",
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"id": "1"},
            {"id": "2"},
        ])))
        .mount(&server)
        .await;

    let mut providers = HashMap::new();
    providers.insert(
        "code-hosting".to_string(),
        ProviderConfig {
            client_id: "client-123".to_string(),
            client_secret: None,
            authorization_endpoint: Some(format!("{}/authorize", server.uri())),
            token_endpoint: Some(format!("{}/token", server.uri())),
            revocation_endpoint: None,
            discovery_url: None,
            scopes: vec![],
            redirect_uri: "https://app.test/callback".to_string(),
            use_pkce: true,
            forced_auth_method: None,
            oidc: false,
        },
    );

    let token_store = Arc::new(TokenStore::new(
        Arc::new(MemoryTokenStore::new()),
        Some(Arc::new(Encryptor::from_passphrase("test-key"))),
        TokenStoreOptions::default(),
    ));
    token_store
        .set(
            "user-1",
            "code-hosting",
            TokenSet {
                access_token: "stale-token".to_string(),
                refresh_token: Some("still-valid-refresh-token".to_string()),
                expires_at: Some(Utc::now() + chrono::Duration::seconds(30)),
                scope: None,
                token_type: None,
                id_token: None,
            },
        )
        .await
        .unwrap();

    let auth_core = Arc::new(AuthCore::new(providers));
    let lock = Arc::new(LocalOnlyRefreshLock::new());
    let http = Arc::new(
        HttpCore::new(
            HttpConfig::default(),
            HashMap::new(),
            Arc::new(CircuitBreakerRegistry::default()),
            Arc::new(NoopMetricsSink),
        )
        .unwrap(),
    );
    let normalizer = Arc::new(Normalizer::new());
    normalizer.register("code-hosting", Arc::new(EchoMapper));

    let adapter = Arc::new(EchoAdapter {
        resource_url: format!("{}/items", server.uri()),
    });

    // Pre-refresh margin of 5 minutes means the 30-second-to-live token
    // above is already inside the refresh window.
    let connector = BaseConnector::new(adapter, token_store.clone(), auth_core, lock, http, normalizer, 5);

    let items = connector.fetch("user-1", None).await.unwrap();
    assert_eq!(items.len(), 2);

    let stored = token_store.get("user-1", "code-hosting", false).await.unwrap().unwrap();
    assert_eq!(stored.access_token, "refreshed-token");
}

#[tokio::test]
async fn concurrent_fetches_coalesce_onto_a_single_refresh() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({
                    "access_token": "refreshed-token",
                    "refresh_token": "still-valid-refresh-token",
                    "expires_in": 3600,
                    "token_type": "Bearer",
                }))
                .set_delay(std::time::Duration::from_millis(150)),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"id": "1"}])))
        .mount(&server)
        .await;

    let mut providers = HashMap::new();
    providers.insert(
        "code-hosting".to_string(),
        ProviderConfig {
            client_id: "client-123".to_string(),
            client_secret: None,
            authorization_endpoint: Some(format!("{}/authorize", server.uri())),
            token_endpoint: Some(format!("{}/token", server.uri())),
            revocation_endpoint: None,
            discovery_url: None,
            scopes: vec![],
            redirect_uri: "https://app.test/callback".to_string(),
            use_pkce: true,
            forced_auth_method: None,
            oidc: false,
        },
    );

    let token_store = Arc::new(TokenStore::new(
        Arc::new(MemoryTokenStore::new()),
        Some(Arc::new(Encryptor::from_passphrase("test-key"))),
        TokenStoreOptions::default(),
    ));
    token_store
        .set(
            "user-1",
            "code-hosting",
            TokenSet {
                access_token: "stale-token".to_string(),
                refresh_token: Some("still-valid-refresh-token".to_string()),
                expires_at: Some(Utc::now() + chrono::Duration::seconds(30)),
                scope: None,
                token_type: None,
                id_token: None,
            },
        )
        .await
        .unwrap();

    let auth_core = Arc::new(AuthCore::new(providers));
    let lock = Arc::new(LocalOnlyRefreshLock::new());
    let http = Arc::new(
        HttpCore::new(
            HttpConfig::default(),
            HashMap::new(),
            Arc::new(CircuitBreakerRegistry::default()),
            Arc::new(NoopMetricsSink),
        )
        .unwrap(),
    );
    let normalizer = Arc::new(Normalizer::new());
    normalizer.register("code-hosting", Arc::new(EchoMapper));

    let adapter = Arc::new(EchoAdapter {
        resource_url: format!("{}/items", server.uri()),
    });

    let connector = Arc::new(BaseConnector::new(
        adapter,
        token_store.clone(),
        auth_core,
        lock,
        http,
        normalizer,
        5,
    ));

    // Ten callers race on the same (user, provider) refresh at once; the
    // delayed mock response gives them a window to actually overlap
    // rather than resolve serially.
    let calls: Vec<_> = (0..10)
        .map(|_| {
            let connector = connector.clone();
            tokio::spawn(async move { connector.get_access_token("user-1").await })
        })
        .collect();
    let results = futures::future::join_all(calls).await;

    for result in results {
        assert_eq!(result.unwrap().unwrap(), "refreshed-token");
    }

    let token_requests = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path() == "/token")
        .count();
    assert_eq!(token_requests, 1, "refresh must be invoked at most once per expiry epoch");
}
