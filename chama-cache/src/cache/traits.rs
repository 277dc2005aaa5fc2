//! Remote store and metrics sink traits.
//!
//! The remote store is the seam between the cache manager and the networked
//! key/value backend. It speaks in raw versioned keys and byte payloads so it
//! stays object-safe and free of serialization concerns; framing and typed
//! values live in the manager.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chama_core::TransportError;

/// Result type for remote store calls.
pub type RemoteResult<T> = Result<T, TransportError>;

/// Networked key/value backend shared across processes.
///
/// Implementations retry internally a bounded number of times and keep
/// [`is_healthy`](RemoteStore::is_healthy) current on connect, disconnect and
/// error events.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Fetch a value.
    async fn get(&self, key: &str) -> RemoteResult<Option<Vec<u8>>>;

    /// Store a value with an expiry, overwriting any previous value.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> RemoteResult<()>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> RemoteResult<u64>;

    /// One step of a cursor-driven scan.
    ///
    /// `pattern` is in the native pattern dialect. Cursor `0` starts a scan
    /// and a returned cursor of `0` ends it. `count` is a hint.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize)
        -> RemoteResult<(u64, Vec<String>)>;

    /// Atomically add `delta` to an integer value.
    ///
    /// An absent key is created at zero with expiry `ttl` in the same atomic
    /// step. An existing key keeps whatever expiry it has.
    async fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> RemoteResult<i64>;

    /// Fetch many values in one round trip, positionally.
    async fn mget(&self, keys: &[String]) -> RemoteResult<Vec<Option<Vec<u8>>>>;

    /// Store many values with one shared expiry.
    async fn mset(&self, entries: Vec<(String, Vec<u8>)>, ttl: Duration) -> RemoteResult<()>;

    /// Store `token` under `key` only if the key is absent.
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> RemoteResult<bool>;

    /// Delete `key` only if it currently holds `token`, atomically.
    async fn compare_and_delete(&self, key: &str, token: &str) -> RemoteResult<bool>;

    /// Last known transport health.
    fn is_healthy(&self) -> bool;
}

// ============================================================================
// METRICS
// ============================================================================

/// Cache operation labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOp {
    Get,
    Set,
    Delete,
    Invalidate,
    Incr,
}

impl CacheOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Delete => "delete",
            Self::Invalidate => "invalidate",
            Self::Incr => "incr",
        }
    }
}

impl fmt::Display for CacheOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache operation outcome labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOutcome {
    HitLocal,
    HitRemote,
    Miss,
    Stored,
    Deleted,
    Rejected,
    Error,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HitLocal => "hit_local",
            Self::HitRemote => "hit_remote",
            Self::Miss => "miss",
            Self::Stored => "stored",
            Self::Deleted => "deleted",
            Self::Rejected => "rejected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for cache outcome counters.
pub trait CacheMetrics: Send + Sync {
    /// Count one operation outcome.
    fn record(&self, op: CacheOp, outcome: CacheOutcome);

    /// Report the current local tier occupancy.
    fn observe_local(&self, _items: usize, _bytes: usize) {}
}

/// Metrics sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl CacheMetrics for NoopMetrics {
    fn record(&self, _op: CacheOp, _outcome: CacheOutcome) {}
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads served by either tier.
    pub hits: u64,
    /// Reads served by neither tier.
    pub misses: u64,
    /// Entries currently held locally.
    pub entry_count: u64,
    /// Approximate local memory usage in bytes.
    pub memory_bytes: u64,
    /// Local entries evicted to stay within budget.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
