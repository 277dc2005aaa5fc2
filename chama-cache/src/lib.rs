//! Chama Cache - Multi-Layer Cache Manager
//!
//! Read-through caching for the chama backend: a bounded local LRU in front
//! of a shared Redis tier, with per-key stampede protection, pattern-based
//! invalidation, a circuit breaker around the remote tier and versioned
//! keys for bulk invalidation on deploy.

pub mod cache;

pub use cache::{
    CacheHealth, CacheManager, CacheMetrics, CacheOp, CacheOutcome, CacheRead, CacheStats,
    CacheTier, ChamaScopedKey, CircuitBreaker, EntryKind, Freshness, GlobPattern, HeldLock,
    InMemoryRemoteStore, InvalidationReport, InvalidationScanner, LocalCache, LockAttempt,
    NoopMetrics, PendingFetches, RedisRemoteStore, RemoteStore, VersionedKey,
};

pub use chama_core::{CacheConfig, ChamaError, ChamaResult};
