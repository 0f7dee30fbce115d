//! Durable `(userId, provider) -> StoredToken` mapping with at-rest
//! encryption and expiry-buffer semantics.
//!
//! The backend trait only ever sees ciphertext for `access_token` /
//! `refresh_token` / `id_token` — `TokenStore` owns the `Encryptor` and
//! encrypts/decrypts at the boundary, keeping storage and crypto concerns
//! separate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::crypto::Encryptor;
use crate::error::{SdkError, SdkResult};
use crate::metrics::{MetricsSink, NoopMetricsSink};
use crate::model::TokenSet;

/// Row shape handed to/from a backend. Token fields are ciphertext once an
/// `Encryptor` is configured; plaintext otherwise (graceful degradation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTokenRow {
    pub user_id: String,
    pub provider: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub token_type: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait TokenStoreBackend: Send + Sync {
    async fn get_raw(&self, user_id: &str, provider: &str) -> SdkResult<Option<StoredTokenRow>>;
    async fn put_raw(&self, row: StoredTokenRow, ttl: Option<StdDuration>) -> SdkResult<()>;
    async fn delete_raw(&self, user_id: &str, provider: &str) -> SdkResult<()>;
    async fn list_raw(&self, user_id: &str) -> SdkResult<Vec<String>>;
}

// ── In-memory backend (tests, or single-process deployments) ───────────

#[derive(Default)]
pub struct MemoryTokenStore {
    rows: RwLock<HashMap<(String, String), (StoredTokenRow, Option<std::time::Instant>)>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStoreBackend for MemoryTokenStore {
    async fn get_raw(&self, user_id: &str, provider: &str) -> SdkResult<Option<StoredTokenRow>> {
        let key = (user_id.to_string(), provider.to_string());
        let mut rows = self.rows.write().await;
        match rows.get(&key) {
            Some((_, Some(deadline))) if std::time::Instant::now() >= *deadline => {
                rows.remove(&key);
                Ok(None)
            }
            Some((row, _)) => Ok(Some(row.clone())),
            None => Ok(None),
        }
    }

    async fn put_raw(&self, row: StoredTokenRow, ttl: Option<StdDuration>) -> SdkResult<()> {
        let key = (row.user_id.clone(), row.provider.clone());
        let deadline = ttl.map(|d| std::time::Instant::now() + d);
        self.rows.write().await.insert(key, (row, deadline));
        Ok(())
    }

    async fn delete_raw(&self, user_id: &str, provider: &str) -> SdkResult<()> {
        self.rows
            .write()
            .await
            .remove(&(user_id.to_string(), provider.to_string()));
        Ok(())
    }

    async fn list_raw(&self, user_id: &str) -> SdkResult<Vec<String>> {
        Ok(self
            .rows
            .read()
            .await
            .keys()
            .filter(|(u, _)| u == user_id)
            .map(|(_, p)| p.clone())
            .collect())
    }
}

// ── Relational backend (structured columns, sqlx/Postgres) ─────────────

pub struct PostgresTokenStore {
    pool: sqlx::PgPool,
    table: &'static str,
}

impl PostgresTokenStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            table: "ingest_sdk_tokens",
        }
    }

    /// Create the backing table if it doesn't already exist. Callers that
    /// manage migrations themselves can skip this.
    pub async fn ensure_schema(&self) -> SdkResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ingest_sdk_tokens (
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                id_token TEXT,
                expires_at TIMESTAMPTZ,
                scope TEXT,
                token_type TEXT,
                metadata JSONB,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                ttl_expires_at TIMESTAMPTZ,
                PRIMARY KEY (user_id, provider)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SdkError::Storage(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl TokenStoreBackend for PostgresTokenStore {
    async fn get_raw(&self, user_id: &str, provider: &str) -> SdkResult<Option<StoredTokenRow>> {
        let row = sqlx::query_as::<_, PgTokenRow>(&format!(
            "SELECT user_id, provider, access_token, refresh_token, id_token, expires_at, \
             scope, token_type, metadata, created_at, updated_at \
             FROM {} WHERE user_id = $1 AND provider = $2 \
             AND (ttl_expires_at IS NULL OR ttl_expires_at > now())",
            self.table
        ))
        .bind(user_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SdkError::Storage(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn put_raw(&self, row: StoredTokenRow, ttl: Option<StdDuration>) -> SdkResult<()> {
        let ttl_expires_at = ttl.map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_default());
        sqlx::query(&format!(
            "INSERT INTO {} (user_id, provider, access_token, refresh_token, id_token, \
             expires_at, scope, token_type, metadata, created_at, updated_at, ttl_expires_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12) \
             ON CONFLICT (user_id, provider) DO UPDATE SET \
             access_token = $3, refresh_token = $4, id_token = $5, expires_at = $6, \
             scope = $7, token_type = $8, metadata = $9, updated_at = $11, ttl_expires_at = $12",
            self.table
        ))
        .bind(&row.user_id)
        .bind(&row.provider)
        .bind(&row.access_token)
        .bind(&row.refresh_token)
        .bind(&row.id_token)
        .bind(row.expires_at)
        .bind(&row.scope)
        .bind(&row.token_type)
        .bind(&row.metadata)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(ttl_expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SdkError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn delete_raw(&self, user_id: &str, provider: &str) -> SdkResult<()> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE user_id = $1 AND provider = $2",
            self.table
        ))
        .bind(user_id)
        .bind(provider)
        .execute(&self.pool)
        .await
        .map_err(|e| SdkError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn list_raw(&self, user_id: &str) -> SdkResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT provider FROM {} WHERE user_id = $1 \
             AND (ttl_expires_at IS NULL OR ttl_expires_at > now())",
            self.table
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SdkError::Storage(e.to_string()))?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }
}

#[derive(sqlx::FromRow)]
struct PgTokenRow {
    user_id: String,
    provider: String,
    access_token: String,
    refresh_token: Option<String>,
    id_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    scope: Option<String>,
    token_type: Option<String>,
    metadata: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<PgTokenRow> for StoredTokenRow {
    fn from(r: PgTokenRow) -> Self {
        StoredTokenRow {
            user_id: r.user_id,
            provider: r.provider,
            access_token: r.access_token,
            refresh_token: r.refresh_token,
            id_token: r.id_token,
            expires_at: r.expires_at,
            scope: r.scope,
            token_type: r.token_type,
            metadata: r.metadata,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

// ── Durable key/value backend ────────────────────────────────────────────
//
// `durable-kv` is a distinct backend option from `relational`: a generic
// opaque-blob-behind-a-key shape, built here on the same sqlx/Postgres
// stack the relational backend uses — a `(key, value jsonb, expires_at)`
// table instead of structured columns. A deployment with an actual
// managed kv store swaps this implementation behind the same
// `TokenStoreBackend` trait.

pub struct KvTokenStore {
    pool: sqlx::PgPool,
    table: &'static str,
}

impl KvTokenStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            table: "ingest_sdk_kv",
        }
    }

    pub async fn ensure_schema(&self) -> SdkResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ingest_sdk_kv (
                key TEXT PRIMARY KEY,
                value JSONB NOT NULL,
                expires_at TIMESTAMPTZ
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SdkError::Storage(e.to_string()))?;
        Ok(())
    }

    fn key(user_id: &str, provider: &str) -> String {
        format!("token:{user_id}:{provider}")
    }
}

#[async_trait]
impl TokenStoreBackend for KvTokenStore {
    async fn get_raw(&self, user_id: &str, provider: &str) -> SdkResult<Option<StoredTokenRow>> {
        let key = Self::key(user_id, provider);
        let row: Option<(serde_json::Value,)> = sqlx::query_as(&format!(
            "SELECT value FROM {} WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
            self.table
        ))
        .bind(&key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SdkError::Storage(e.to_string()))?;

        row.map(|(v,)| serde_json::from_value(v).map_err(|e| SdkError::Storage(e.to_string())))
            .transpose()
    }

    async fn put_raw(&self, row: StoredTokenRow, ttl: Option<StdDuration>) -> SdkResult<()> {
        let key = Self::key(&row.user_id, &row.provider);
        let expires_at = ttl.map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_default());
        let value = serde_json::to_value(&row).map_err(|e| SdkError::Storage(e.to_string()))?;
        sqlx::query(&format!(
            "INSERT INTO {} (key, value, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE SET value = $2, expires_at = $3",
            self.table
        ))
        .bind(&key)
        .bind(&value)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SdkError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn delete_raw(&self, user_id: &str, provider: &str) -> SdkResult<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE key = $1", self.table))
            .bind(Self::key(user_id, provider))
            .execute(&self.pool)
            .await
            .map_err(|e| SdkError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn list_raw(&self, user_id: &str) -> SdkResult<Vec<String>> {
        let prefix = format!("token:{user_id}:%");
        let rows: Vec<(String,)> = sqlx::query_as(&format!(
            "SELECT key FROM {} WHERE key LIKE $1 AND (expires_at IS NULL OR expires_at > now())",
            self.table
        ))
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SdkError::Storage(e.to_string()))?;
        Ok(rows
            .into_iter()
            .filter_map(|(k,)| k.rsplit(':').next().map(str::to_string))
            .collect())
    }
}

// ── Public facade: encryption + expiry-buffer semantics ─────────────────

pub struct TokenStore {
    backend: Arc<dyn TokenStoreBackend>,
    encryptor: Option<Arc<Encryptor>>,
    expired_token_buffer: chrono::Duration,
    default_ttl: StdDuration,
    metrics: Arc<dyn MetricsSink>,
}

pub struct TokenStoreOptions {
    pub expired_token_buffer_minutes: u32,
    pub default_ttl: StdDuration,
}

impl Default for TokenStoreOptions {
    fn default() -> Self {
        Self {
            expired_token_buffer_minutes: 5,
            default_ttl: StdDuration::from_secs(3600),
        }
    }
}

impl TokenStore {
    pub fn new(
        backend: Arc<dyn TokenStoreBackend>,
        encryptor: Option<Arc<Encryptor>>,
        options: TokenStoreOptions,
    ) -> Self {
        Self {
            backend,
            encryptor,
            expired_token_buffer: chrono::Duration::minutes(
                options.expired_token_buffer_minutes as i64,
            ),
            default_ttl: options.default_ttl,
            metrics: Arc::new(NoopMetricsSink),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    fn decrypt(&self, value: &str) -> SdkResult<String> {
        match &self.encryptor {
            Some(enc) => enc.decrypt(value).map_err(SdkError::Storage),
            None => Ok(value.to_string()),
        }
    }

    fn encrypt(&self, value: &str) -> SdkResult<String> {
        match &self.encryptor {
            Some(enc) => enc.encrypt(value).map_err(SdkError::Storage),
            None => Ok(value.to_string()),
        }
    }

    fn row_to_token_set(&self, row: &StoredTokenRow) -> SdkResult<TokenSet> {
        Ok(TokenSet {
            access_token: self.decrypt(&row.access_token)?,
            refresh_token: row
                .refresh_token
                .as_deref()
                .map(|t| self.decrypt(t))
                .transpose()?,
            expires_at: row.expires_at,
            scope: row.scope.clone(),
            token_type: row.token_type.clone(),
            id_token: row.id_token.as_deref().map(|t| self.decrypt(t)).transpose()?,
        })
    }

    /// Load a token, applying expiry + buffer semantics.
    pub async fn get(
        &self,
        user_id: &str,
        provider: &str,
        include_expired: bool,
    ) -> SdkResult<Option<TokenSet>> {
        let Some(row) = self.backend.get_raw(user_id, provider).await? else {
            return Ok(None);
        };

        let Some(expires_at) = row.expires_at else {
            return Ok(Some(self.row_to_token_set(&row)?));
        };

        let now = Utc::now();
        if now < expires_at {
            return Ok(Some(self.row_to_token_set(&row)?));
        }

        if !include_expired {
            return Ok(None);
        }

        if now > expires_at + self.expired_token_buffer {
            self.delete(user_id, provider).await?;
            return Ok(None);
        }

        Ok(Some(self.row_to_token_set(&row)?))
    }

    /// Create or overwrite the stored token set for `(user_id, provider)`.
    pub async fn set(&self, user_id: &str, provider: &str, token_set: TokenSet) -> SdkResult<()> {
        let now = Utc::now();
        let ttl = match token_set.expires_at {
            Some(expires_at) => {
                let until = expires_at - now + self.expired_token_buffer;
                until.to_std().ok()
            }
            None => Some(self.default_ttl),
        };

        let row = StoredTokenRow {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            access_token: self.encrypt(&token_set.access_token)?,
            refresh_token: token_set
                .refresh_token
                .as_deref()
                .map(|t| self.encrypt(t))
                .transpose()?,
            id_token: token_set.id_token.as_deref().map(|t| self.encrypt(t)).transpose()?,
            expires_at: token_set.expires_at,
            scope: token_set.scope,
            token_type: token_set.token_type,
            metadata: None,
            created_at: now,
            updated_at: now,
        };

        self.backend.put_raw(row, ttl).await?;
        self.metrics.counter("token_store_writes_total", &[("provider", provider)], 1);
        Ok(())
    }

    /// Alias for `set` — the contract names both, both overwrite.
    pub async fn update(&self, user_id: &str, provider: &str, token_set: TokenSet) -> SdkResult<()> {
        self.set(user_id, provider, token_set).await
    }

    pub async fn delete(&self, user_id: &str, provider: &str) -> SdkResult<()> {
        self.backend.delete_raw(user_id, provider).await
    }

    pub async fn list(&self, user_id: &str) -> SdkResult<Vec<String>> {
        self.backend.list_raw(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(expires_in: chrono::Duration) -> TokenSet {
        TokenSet {
            access_token: "access-123".to_string(),
            refresh_token: Some("refresh-456".to_string()),
            expires_at: Some(Utc::now() + expires_in),
            scope: Some("read".to_string()),
            token_type: Some("Bearer".to_string()),
            id_token: None,
        }
    }

    fn store() -> TokenStore {
        TokenStore::new(
            Arc::new(MemoryTokenStore::new()),
            Some(Arc::new(Encryptor::from_passphrase("test-key"))),
            TokenStoreOptions::default(),
        )
    }

    #[tokio::test]
    async fn get_returns_none_for_missing() {
        let store = store();
        assert!(store.get("u1", "github", false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_without_include_expired_hides_past_expiry() {
        let store = store();
        store
            .set("u1", "github", token(chrono::Duration::seconds(-10)))
            .await
            .unwrap();
        assert!(store.get("u1", "github", false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_with_include_expired_returns_within_buffer() {
        let store = store();
        store
            .set("u1", "github", token(chrono::Duration::seconds(-10)))
            .await
            .unwrap();
        let got = store.get("u1", "github", true).await.unwrap();
        assert!(got.is_some());
        assert_eq!(got.unwrap().access_token, "access-123");
    }

    #[tokio::test]
    async fn set_then_get_round_trips_through_encryption() {
        let store = store();
        store
            .set("u1", "github", token(chrono::Duration::hours(1)))
            .await
            .unwrap();
        let got = store.get("u1", "github", false).await.unwrap().unwrap();
        assert_eq!(got.access_token, "access-123");
        assert_eq!(got.refresh_token.as_deref(), Some("refresh-456"));
    }

    #[tokio::test]
    async fn delete_removes_token() {
        let store = store();
        store
            .set("u1", "github", token(chrono::Duration::hours(1)))
            .await
            .unwrap();
        store.delete("u1", "github").await.unwrap();
        assert!(store.get("u1", "github", true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_returns_all_providers_for_user() {
        let store = store();
        store
            .set("u1", "github", token(chrono::Duration::hours(1)))
            .await
            .unwrap();
        store
            .set("u1", "google", token(chrono::Duration::hours(1)))
            .await
            .unwrap();
        let mut providers = store.list("u1").await.unwrap();
        providers.sort();
        assert_eq!(providers, vec!["github".to_string(), "google".to_string()]);
    }
}
