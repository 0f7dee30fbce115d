//! Bounded conditional-request cache.
//!
//! Keyed by a fingerprint over `(user_id, provider, resource)`; `HttpCore`
//! owns TTL/staleness decisions, this module only owns eviction once the
//! cache is full.

use std::sync::Mutex;

use lru::LruCache;

use crate::model::ETagEntry;

const DEFAULT_CAPACITY: usize = 2048;

pub struct EtagCache {
    entries: Mutex<LruCache<String, ETagEntry>>,
}

impl EtagCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn fingerprint(user_id: &str, provider: &str, resource: &str) -> String {
        format!("{user_id}\u{1}{provider}\u{1}{resource}")
    }

    pub fn get(&self, key: &str) -> Option<ETagEntry> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn put(&self, key: String, entry: ETagEntry) {
        self.entries.lock().unwrap().put(key, entry);
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.lock().unwrap().pop(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EtagCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(tag: &str) -> ETagEntry {
        ETagEntry {
            etag: tag.to_string(),
            payload: serde_json::json!({"ok": true}),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn stores_and_retrieves_by_fingerprint() {
        let cache = EtagCache::new(4);
        let key = EtagCache::fingerprint("u1", "github", "repos");
        cache.put(key.clone(), entry("abc"));
        assert_eq!(cache.get(&key).unwrap().etag, "abc");
    }

    #[test]
    fn evicts_oldest_when_over_capacity() {
        let cache = EtagCache::new(2);
        cache.put("a".into(), entry("1"));
        cache.put("b".into(), entry("2"));
        cache.put("c".into(), entry("3"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = EtagCache::new(4);
        cache.put("k".into(), entry("1"));
        cache.invalidate("k");
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn distinct_fingerprints_for_distinct_resources() {
        let a = EtagCache::fingerprint("u1", "github", "repos");
        let b = EtagCache::fingerprint("u1", "github", "starred");
        assert_ne!(a, b);
    }
}
