//! In-process cache tier.
//!
//! A byte- and item-bounded LRU map. Expired entries read as absent and are
//! dropped on access; budget overruns evict least-recently-used entries
//! first. Values are kept as serialized bytes so both tiers share one
//! representation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chama_core::constants::MAX_TTL_SECS;
use chrono::{DateTime, Utc};
use lru::LruCache;
use tokio::time::Instant;

use super::glob::GlobPattern;

/// Fixed per-entry bookkeeping cost added to the byte estimate.
const ENTRY_OVERHEAD_BYTES: usize = 64;

/// Expiry instant for `ttl`, saturating to one year out when the clock
/// cannot represent it.
fn deadline(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(MAX_TTL_SECS))
}

/// A value held by the local tier.
#[derive(Debug, Clone)]
pub struct LocalEntry {
    pub value: Arc<Vec<u8>>,
    pub stored_at: DateTime<Utc>,
    expires_at: Instant,
    size: usize,
}

impl LocalEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

struct LocalInner {
    entries: LruCache<String, LocalEntry>,
    bytes: usize,
}

impl LocalInner {
    fn remove(&mut self, key: &str) -> Option<LocalEntry> {
        let entry = self.entries.pop(key)?;
        self.bytes = self.bytes.saturating_sub(entry.size);
        Some(entry)
    }
}

/// Bounded in-process key/value store with TTL and LRU eviction.
pub struct LocalCache {
    inner: Mutex<LocalInner>,
    max_items: usize,
    max_bytes: usize,
    evictions: AtomicU64,
}

impl LocalCache {
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(LocalInner {
                entries: LruCache::unbounded(),
                bytes: 0,
            }),
            max_items,
            max_bytes,
            evictions: AtomicU64::new(0),
        }
    }

    /// Estimated memory held by an entry.
    pub fn estimate_size(key: &str, value: &[u8]) -> usize {
        key.len() + value.len() + ENTRY_OVERHEAD_BYTES
    }

    /// Fetch an unexpired entry and mark it most recently used.
    pub fn get(&self, key: &str) -> Option<LocalEntry> {
        let Ok(mut inner) = self.inner.lock() else {
            return None;
        };
        let now = Instant::now();
        let expired = inner.entries.peek(key)?.is_expired(now);
        if expired {
            inner.remove(key);
            return None;
        }
        inner.entries.get(key).cloned()
    }

    /// Store a value. Returns false if the entry alone exceeds the byte
    /// budget, in which case nothing changes.
    pub fn set(&self, key: &str, value: Vec<u8>, stored_at: DateTime<Utc>, ttl: Duration) -> bool {
        let size = Self::estimate_size(key, &value);
        if size > self.max_bytes {
            return false;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };

        let entry = LocalEntry {
            value: Arc::new(value),
            stored_at,
            expires_at: deadline(Instant::now(), ttl),
            size,
        };
        if let Some((_, replaced)) = inner.entries.push(key.to_string(), entry) {
            inner.bytes = inner.bytes.saturating_sub(replaced.size);
        }
        inner.bytes += size;

        let mut evicted = 0u64;
        while inner.entries.len() > self.max_items || inner.bytes > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((_, old)) => {
                    inner.bytes = inner.bytes.saturating_sub(old.size);
                    evicted += 1;
                }
                None => break,
            }
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
        true
    }

    /// Remove an entry. Returns true if it was present.
    pub fn delete(&self, key: &str) -> bool {
        match self.inner.lock() {
            Ok(mut inner) => inner.remove(key).is_some(),
            Err(_) => false,
        }
    }

    /// Remove every entry whose key matches `pattern`.
    pub fn remove_matching(&self, pattern: &GlobPattern) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let doomed: Vec<String> = inner
            .entries
            .iter()
            .filter(|(key, _)| pattern.matches(key))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            inner.remove(key);
        }
        doomed.len()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
            inner.bytes = 0;
        }
    }

    /// Number of entries held, including expired ones not yet dropped.
    pub fn size(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    /// Estimated bytes held.
    pub fn bytes(&self) -> usize {
        self.inner.lock().map(|i| i.bytes).unwrap_or(0)
    }

    /// Entries evicted to stay within budget since creation.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("items", &self.size())
            .field("bytes", &self.bytes())
            .field("max_items", &self.max_items)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ttl() -> Duration {
        Duration::from_secs(60)
    }

    #[test]
    fn test_set_then_get() {
        let cache = LocalCache::new(10, 1 << 20);
        assert!(cache.set("v1:a", b"1".to_vec(), Utc::now(), ttl()));
        let entry = cache.get("v1:a").expect("entry present");
        assert_eq!(entry.value.as_slice(), b"1");
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_item_budget_evicts_least_recently_used() {
        let cache = LocalCache::new(2, 1 << 20);
        cache.set("a", b"1".to_vec(), Utc::now(), ttl());
        cache.set("b", b"2".to_vec(), Utc::now(), ttl());
        // Touch "a" so "b" becomes least recently used.
        assert!(cache.get("a").is_some());
        cache.set("c", b"3".to_vec(), Utc::now(), ttl());

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn test_byte_budget_evicts() {
        let entry = LocalCache::estimate_size("k0", &[0u8; 100]);
        let cache = LocalCache::new(100, entry * 2);
        for i in 0..3 {
            cache.set(&format!("k{i}"), vec![0u8; 100], Utc::now(), ttl());
        }
        assert_eq!(cache.size(), 2);
        assert!(cache.bytes() <= entry * 2);
        assert!(cache.get("k0").is_none());
    }

    #[test]
    fn test_oversized_entry_is_refused() {
        let cache = LocalCache::new(10, 128);
        cache.set("small", b"x".to_vec(), Utc::now(), ttl());
        assert!(!cache.set("big", vec![0u8; 512], Utc::now(), ttl()));
        assert!(cache.get("small").is_some());
        assert_eq!(cache.evictions(), 0);
    }

    #[test]
    fn test_overwrite_adjusts_bytes() {
        let cache = LocalCache::new(10, 1 << 20);
        cache.set("k", vec![0u8; 1000], Utc::now(), ttl());
        cache.set("k", vec![0u8; 10], Utc::now(), ttl());
        assert_eq!(cache.bytes(), LocalCache::estimate_size("k", &[0u8; 10]));
        assert_eq!(cache.size(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_reads_absent() {
        let cache = LocalCache::new(10, 1 << 20);
        cache.set("k", b"v".to_vec(), Utc::now(), Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(cache.get("k").is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("k").is_none());
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.bytes(), 0);
    }

    #[test]
    fn test_unrepresentable_ttl_is_stored() {
        let cache = LocalCache::new(10, 1 << 20);
        assert!(cache.set("k", b"v".to_vec(), Utc::now(), Duration::MAX));
        assert!(cache.get("k").is_some());
    }

    #[test]
    fn test_remove_matching() {
        let cache = LocalCache::new(10, 1 << 20);
        cache.set("v1:chama:1:members", b"a".to_vec(), Utc::now(), ttl());
        cache.set("v1:chama:1:loans", b"b".to_vec(), Utc::now(), ttl());
        cache.set("v1:chama:2:members", b"c".to_vec(), Utc::now(), ttl());

        let pattern = GlobPattern::parse("v1:chama:1:*").unwrap();
        assert_eq!(cache.remove_matching(&pattern), 2);
        assert_eq!(cache.size(), 1);
        assert!(cache.get("v1:chama:2:members").is_some());
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = LocalCache::new(10, 1 << 20);
        cache.set("a", b"1".to_vec(), Utc::now(), ttl());
        cache.set("b", b"2".to_vec(), Utc::now(), ttl());
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        cache.clear();
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.bytes(), 0);
    }
}
