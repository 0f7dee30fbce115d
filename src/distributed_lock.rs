//! Cross-process refresh coordination.
//!
//! The contract is a `SET NX EX`-shaped primitive: acquire only succeeds
//! when no other process holds the lock, and it self-expires so a crashed
//! holder can't wedge other processes forever. Built on the same
//! sqlx/Postgres stack the relational token store already depends on, via
//! `INSERT ... ON CONFLICT DO NOTHING` against an expiring row. A
//! deployment with a real coordination service swaps this implementation
//! behind the same trait.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{SdkError, SdkResult};

#[async_trait]
pub trait DistributedRefreshLock: Send + Sync {
    /// Attempt to acquire the lock for `key`, holding it for `ttl`. Returns
    /// `true` if this call acquired it, `false` if another holder has it.
    async fn try_acquire(&self, key: &str, ttl: StdDuration) -> SdkResult<bool>;

    /// Block (polling) until the lock for `key` is released or `timeout`
    /// elapses. Returns `true` if the lock was observed released within
    /// the timeout.
    async fn wait_for_release(&self, key: &str, timeout: StdDuration) -> SdkResult<bool>;

    /// Release the lock for `key`. A no-op if this process doesn't hold it.
    async fn release(&self, key: &str) -> SdkResult<()>;

    /// Whether this lock is actually coordinating across processes, or
    /// quietly degraded to local-only (no coordination service
    /// configured). Surfaced via `Sdk::health()`.
    fn is_degraded(&self) -> bool {
        false
    }
}

const POLL_INTERVAL: StdDuration = StdDuration::from_millis(200);

/// Postgres-backed lock: a single row per key, alive while `expires_at > now()`.
pub struct PostgresRefreshLock {
    pool: sqlx::PgPool,
    table: &'static str,
}

impl PostgresRefreshLock {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            table: "ingest_sdk_locks",
        }
    }

    pub async fn ensure_schema(&self) -> SdkResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ingest_sdk_locks (
                key TEXT PRIMARY KEY,
                expires_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SdkError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn holds(&self, key: &str) -> SdkResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as(&format!(
            "SELECT 1 FROM {} WHERE key = $1 AND expires_at > now()",
            self.table
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SdkError::Storage(e.to_string()))?
        .map(|_| (1,));
        Ok(row.is_some())
    }
}

#[async_trait]
impl DistributedRefreshLock for PostgresRefreshLock {
    async fn try_acquire(&self, key: &str, ttl: StdDuration) -> SdkResult<bool> {
        // Clear any row whose lease already lapsed before attempting the
        // conflict-free insert, so a crashed holder doesn't wedge this key.
        sqlx::query(&format!("DELETE FROM {} WHERE key = $1 AND expires_at <= now()", self.table))
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| SdkError::Storage(e.to_string()))?;

        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        let result = sqlx::query(&format!(
            "INSERT INTO {} (key, expires_at) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING",
            self.table
        ))
        .bind(key)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SdkError::Storage(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn wait_for_release(&self, key: &str, timeout: StdDuration) -> SdkResult<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.holds(key).await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn release(&self, key: &str) -> SdkResult<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE key = $1", self.table))
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| SdkError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// Local-only fallback used when no coordination service is configured.
/// Still correct within a single process (guards against the local
/// single-flight dedup races it sits behind), but does nothing for a
/// fleet of processes — `is_degraded()` reports this so `Sdk::health()`
/// can surface it.
#[derive(Default)]
pub struct LocalOnlyRefreshLock {
    held: Mutex<std::collections::HashMap<String, std::time::Instant>>,
}

impl LocalOnlyRefreshLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedRefreshLock for LocalOnlyRefreshLock {
    async fn try_acquire(&self, key: &str, ttl: StdDuration) -> SdkResult<bool> {
        let mut held = self.held.lock().await;
        let now = std::time::Instant::now();
        if let Some(expiry) = held.get(key) {
            if *expiry > now {
                return Ok(false);
            }
        }
        held.insert(key.to_string(), now + ttl);
        Ok(true)
    }

    async fn wait_for_release(&self, key: &str, timeout: StdDuration) -> SdkResult<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let free = {
                let held = self.held.lock().await;
                held.get(key).is_none_or(|e| *e <= std::time::Instant::now())
            };
            if free {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn release(&self, key: &str) -> SdkResult<()> {
        self.held.lock().await.remove(key);
        Ok(())
    }

    fn is_degraded(&self) -> bool {
        true
    }
}

pub fn lock_key(user_id: &str, provider: &str) -> String {
    format!("refresh:{user_id}:{provider}")
}

pub const DEFAULT_LOCK_TTL: StdDuration = StdDuration::from_secs(30);
pub const DEFAULT_WAIT_TIMEOUT: StdDuration = StdDuration::from_secs(30);

#[allow(dead_code)]
pub type SharedRefreshLock = Arc<dyn DistributedRefreshLock>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_lock_excludes_second_acquirer() {
        let lock = LocalOnlyRefreshLock::new();
        assert!(lock.try_acquire("k", StdDuration::from_secs(5)).await.unwrap());
        assert!(!lock.try_acquire("k", StdDuration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn local_lock_expires() {
        let lock = LocalOnlyRefreshLock::new();
        assert!(lock.try_acquire("k", StdDuration::from_millis(10)).await.unwrap());
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert!(lock.try_acquire("k", StdDuration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn release_frees_the_key_immediately() {
        let lock = LocalOnlyRefreshLock::new();
        assert!(lock.try_acquire("k", StdDuration::from_secs(5)).await.unwrap());
        lock.release("k").await.unwrap();
        assert!(lock.try_acquire("k", StdDuration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_release_observes_release() {
        let lock = Arc::new(LocalOnlyRefreshLock::new());
        lock.try_acquire("k", StdDuration::from_secs(5)).await.unwrap();
        let waiter = lock.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_for_release("k", StdDuration::from_secs(2)).await
        });
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        lock.release("k").await.unwrap();
        assert!(handle.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn local_lock_reports_degraded() {
        let lock = LocalOnlyRefreshLock::new();
        assert!(lock.is_degraded());
    }
}
