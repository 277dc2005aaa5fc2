//! Two-tier cache for chama data.
//!
//! The local tier is a bounded in-process LRU. The remote tier is shared by
//! every process behind a [`RemoteStore`] (Redis in production, an in-memory
//! store in tests). The [`CacheManager`] keeps both tiers coherent for a
//! single key and degrades to local-only service when the remote tier fails.
//!
//! # Keys
//!
//! Every logical key is stored as `{version}:{logical}`. Bumping the
//! configured version makes all older entries unreachable without deleting
//! them; they age out on their TTLs. Tenant-scoped keys follow
//! `chama:{chama_id}:{kind}[:{sub_id}]`, see [`ChamaScopedKey`].
//!
//! # Freshness
//!
//! Reads default to [`Freshness::Ttl`]. Callers that want an upper bound on
//! age opt into [`Freshness::BestEffort`], and [`CacheRead`] reports which
//! tier served the value and how old it is.
//!
//! # Example
//!
//! ```ignore
//! let cache = CacheManager::connect_redis(CacheConfig::from_env()).await?;
//!
//! let key = ChamaScopedKey::new(chama_id, EntryKind::DashboardStats).encode();
//! let dashboard: DashboardStats = cache
//!     .get_or_set(&key, move || load_dashboard(chama_id), None)
//!     .await?;
//!
//! // After a contribution is recorded
//! cache.invalidate(&ChamaScopedKey::tenant_pattern(chama_id), None).await?;
//! ```

pub mod circuit_breaker;
pub mod entry;
pub mod freshness;
pub mod glob;
pub mod invalidation;
pub mod key;
pub mod local;
pub mod lock;
pub mod manager;
pub mod memory_backend;
pub mod redis_backend;
pub mod single_flight;
pub mod traits;

pub use circuit_breaker::CircuitBreaker;
pub use freshness::{CacheRead, CacheTier, Freshness};
pub use glob::GlobPattern;
pub use invalidation::{InvalidationReport, InvalidationScanner};
pub use key::{ChamaScopedKey, EntryKind, EntryKindParseError, VersionedKey};
pub use local::{LocalCache, LocalEntry};
pub use lock::{HeldLock, LockAttempt};
pub use manager::{CacheHealth, CacheManager};
pub use memory_backend::InMemoryRemoteStore;
pub use redis_backend::RedisRemoteStore;
pub use single_flight::{FlightRole, PendingFetches};
pub use traits::{
    CacheMetrics, CacheOp, CacheOutcome, CacheStats, NoopMetrics, RemoteResult, RemoteStore,
};
