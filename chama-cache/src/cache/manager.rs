//! The cache manager.
//!
//! Orchestrates the local tier, the remote tier and the circuit breaker
//! behind one API. Reads go local first, then remote, populating the local
//! tier on a remote hit. Writes go to both tiers. `get_or_set` adds stampede
//! protection: in-process coalescing through [`PendingFetches`] plus an
//! advisory remote lock so that other processes usually wait for the first
//! computation instead of repeating it.
//!
//! Transport failures never fail a read or a plain write: they degrade to a
//! miss or a `false`. Only a fetch error inside `get_or_set`, validation
//! errors and invalidation transport errors reach the caller.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chama_core::constants::MAX_TTL_SECS;
use chama_core::{
    CacheConfig, ChamaError, ChamaResult, CircuitState, HealthCheck, TransportError,
    ValidationError,
};
use chrono::{DateTime, Utc};
use futures_util::future::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::circuit_breaker::CircuitBreaker;
use super::entry::{self, RemoteEntry};
use super::freshness::{CacheRead, CacheTier, Freshness};
use super::glob::GlobPattern;
use super::invalidation::{InvalidationReport, InvalidationScanner};
use super::key::VersionedKey;
use super::local::LocalCache;
use super::lock::{self, HeldLock, LockAttempt};
use super::redis_backend::RedisRemoteStore;
use super::single_flight::{FlightResult, FlightRole, PendingFetches};
use super::traits::{CacheMetrics, CacheOp, CacheOutcome, CacheStats, NoopMetrics, RemoteResult, RemoteStore};

/// JSON encoding of an absent value. Never cached.
const JSON_NULL: &[u8] = b"null";

/// Point-in-time health of both tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHealth {
    pub remote_healthy: bool,
    pub circuit: CircuitState,
    pub local_items: usize,
    pub local_bytes: usize,
}

impl CacheHealth {
    /// True when reads can reach the remote tier.
    pub fn is_fully_operational(&self) -> bool {
        self.remote_healthy && self.circuit != CircuitState::Open
    }

    /// Render as a component health check. A down remote tier is degraded,
    /// never unhealthy, since the local tier keeps serving.
    pub fn to_health_check(&self) -> HealthCheck {
        let check = if self.is_fully_operational() {
            HealthCheck::healthy("cache")
        } else {
            HealthCheck::degraded("cache", "remote tier unavailable, serving from local tier")
        };
        check
            .with_metadata("remote_healthy", self.remote_healthy)
            .with_metadata("circuit", self.circuit.as_str())
            .with_metadata("local_items", self.local_items)
            .with_metadata("local_bytes", self.local_bytes)
    }
}

struct ManagerInner<R: RemoteStore> {
    config: CacheConfig,
    local: LocalCache,
    remote: Arc<R>,
    circuit: CircuitBreaker,
    pending: Arc<PendingFetches>,
    scanner: InvalidationScanner,
    metrics: Arc<dyn CacheMetrics>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Two-tier cache with stampede protection. Cheap to clone; clones share
/// all state.
pub struct CacheManager<R: RemoteStore> {
    inner: Arc<ManagerInner<R>>,
}

impl<R: RemoteStore> Clone for CacheManager<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl CacheManager<RedisRemoteStore> {
    /// Build a manager over Redis using `config.remote`.
    ///
    /// An unreachable Redis does not fail construction; the manager starts
    /// with an unhealthy remote tier and serves from the local tier.
    pub async fn connect_redis(config: CacheConfig) -> ChamaResult<Self> {
        config.validate()?;
        let remote = RedisRemoteStore::connect(config.remote.clone()).await?;
        Self::new(config, Arc::new(remote))
    }
}

impl<R: RemoteStore> CacheManager<R> {
    /// Create a manager with a fresh local tier, breaker and no-op metrics.
    pub fn new(config: CacheConfig, remote: Arc<R>) -> ChamaResult<Self> {
        Self::with_metrics(config, remote, Arc::new(NoopMetrics))
    }

    /// Create a manager reporting to `metrics`.
    pub fn with_metrics(
        config: CacheConfig,
        remote: Arc<R>,
        metrics: Arc<dyn CacheMetrics>,
    ) -> ChamaResult<Self> {
        config.validate()?;
        let local = LocalCache::new(config.local_max_items, config.local_max_bytes);
        let circuit = CircuitBreaker::new(config.circuit.clone());
        Ok(Self::from_parts(config, local, remote, circuit, metrics))
    }

    /// Assemble a manager from already-built parts. The config is not
    /// validated.
    pub fn from_parts(
        config: CacheConfig,
        local: LocalCache,
        remote: Arc<R>,
        circuit: CircuitBreaker,
        metrics: Arc<dyn CacheMetrics>,
    ) -> Self {
        let scanner = InvalidationScanner::from_config(&config);
        info!(
            version = %config.version,
            local_max_items = config.local_max_items,
            local_max_bytes = config.local_max_bytes,
            remote_healthy = remote.is_healthy(),
            "Cache manager started"
        );
        Self {
            inner: Arc::new(ManagerInner {
                config,
                local,
                remote,
                circuit,
                pending: Arc::new(PendingFetches::new()),
                scanner,
                metrics,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.inner.remote
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.inner.circuit.state()
    }

    /// Number of `get_or_set` computations currently in flight.
    pub fn pending_fetches(&self) -> usize {
        self.inner.pending.len()
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Read a value. Never fails: invalid keys, transport errors and
    /// undecodable entries all read as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_with(key, Freshness::Ttl)
            .await
            .map(CacheRead::into_value)
    }

    /// Read a value under an explicit freshness requirement, reporting which
    /// tier served it and how old it is.
    pub async fn get_with<T: DeserializeOwned>(
        &self,
        key: &str,
        freshness: Freshness,
    ) -> Option<CacheRead<T>> {
        let vkey = match self.versioned(key) {
            Ok(vkey) => vkey,
            Err(e) => {
                debug!(key, error = %e, "Rejected cache read");
                self.record(CacheOp::Get, CacheOutcome::Rejected);
                return None;
            }
        };

        if let Some(found) = self.lookup(&vkey, &freshness).await {
            match serde_json::from_slice::<T>(&found.bytes) {
                Ok(value) => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    let outcome = match found.tier {
                        CacheTier::Local => CacheOutcome::HitLocal,
                        CacheTier::Remote => CacheOutcome::HitRemote,
                    };
                    self.record(CacheOp::Get, outcome);
                    debug!(key, tier = %found.tier, "Cache hit");
                    return Some(CacheRead::new(value, found.stored_at, found.tier));
                }
                Err(e) => {
                    warn!(key, error = %e, "Cached value does not decode as requested type");
                }
            }
        }

        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        self.record(CacheOp::Get, CacheOutcome::Miss);
        debug!(key, "Cache miss");
        None
    }

    /// Read many values. Results are positional; invalid keys read as
    /// `None`. Local hits are served first and the rest fetched from the
    /// remote tier in one round trip.
    pub async fn mget<T: DeserializeOwned>(&self, keys: &[&str]) -> Vec<Option<T>> {
        let mut results: Vec<Option<T>> = Vec::with_capacity(keys.len());
        let mut missing: Vec<(usize, VersionedKey)> = Vec::new();

        for (idx, key) in keys.iter().enumerate() {
            let Ok(vkey) = self.versioned(key) else {
                self.record(CacheOp::Get, CacheOutcome::Rejected);
                results.push(None);
                continue;
            };
            let local = self
                .inner
                .local
                .get(vkey.as_str())
                .and_then(|e| serde_json::from_slice::<T>(&e.value).ok());
            match local {
                Some(value) => {
                    self.inner.hits.fetch_add(1, Ordering::Relaxed);
                    self.record(CacheOp::Get, CacheOutcome::HitLocal);
                    results.push(Some(value));
                }
                None => {
                    results.push(None);
                    missing.push((idx, vkey));
                }
            }
        }

        if !missing.is_empty() && self.remote_allowed() {
            let remote_keys: Vec<String> =
                missing.iter().map(|(_, k)| k.as_str().to_string()).collect();
            let fetched = self.settle(
                CacheOp::Get,
                "mget",
                self.inner.remote.mget(&remote_keys).await,
            );
            if let Ok(values) = fetched {
                for ((idx, vkey), raw) in missing.iter().zip(values) {
                    let Some(raw) = raw else { continue };
                    let Some(entry) = RemoteEntry::decode(&raw) else { continue };
                    if let Ok(value) = serde_json::from_slice::<T>(entry.payload) {
                        self.populate_local(vkey, &entry);
                        self.inner.hits.fetch_add(1, Ordering::Relaxed);
                        self.record(CacheOp::Get, CacheOutcome::HitRemote);
                        results[*idx] = Some(value);
                    }
                }
            }
        }

        let misses = missing
            .iter()
            .filter(|(idx, _)| results[*idx].is_none())
            .count();
        for _ in 0..misses {
            self.record(CacheOp::Get, CacheOutcome::Miss);
        }
        self.inner.misses.fetch_add(misses as u64, Ordering::Relaxed);
        results
    }

    /// Read a counter maintained by [`incr`](Self::incr) without changing it.
    pub async fn counter(&self, key: &str) -> Option<i64> {
        let vkey = self.versioned(key).ok()?;
        if !self.remote_allowed() {
            return None;
        }
        let raw = self
            .settle(CacheOp::Get, key, self.inner.remote.get(vkey.as_str()).await)
            .ok()??;
        std::str::from_utf8(&raw).ok()?.parse().ok()
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Store a value in both tiers, surfacing why it failed.
    ///
    /// Size limits are checked before any I/O, so a rejected value mutates
    /// neither tier. `ttl: None` resolves through the configured TTL policy.
    /// While the circuit is open only the local tier is written and the call
    /// still succeeds.
    pub async fn try_set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> ChamaResult<()> {
        let vkey = self
            .versioned(key)
            .inspect_err(|_| self.record(CacheOp::Set, CacheOutcome::Rejected))?;
        let json = serde_json::to_vec(value)?;
        self.check_value_size(json.len())
            .inspect_err(|_| self.record(CacheOp::Set, CacheOutcome::Rejected))?;
        let ttl = self.resolve_ttl(key, ttl);
        self.store(&vkey, json, ttl).await
    }

    /// Store a value in both tiers. Returns false on any failure.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> bool {
        match self.try_set(key, value, ttl).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "Cache set failed");
                false
            }
        }
    }

    /// Store many values. All entries are validated before anything is
    /// written; one invalid entry rejects the whole batch.
    pub async fn mset<T: Serialize>(&self, entries: &[(&str, T)], ttl: Option<Duration>) -> bool {
        let mut prepared = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let checked = self.versioned(key).map_err(ChamaError::from).and_then(|vkey| {
                let json = serde_json::to_vec(value)?;
                self.check_value_size(json.len())?;
                Ok((vkey, json))
            });
            match checked {
                Ok((vkey, json)) => {
                    prepared.push((vkey, json, self.resolve_ttl(key, ttl)));
                }
                Err(e) => {
                    warn!(key, error = %e, "Cache mset rejected");
                    self.record(CacheOp::Set, CacheOutcome::Rejected);
                    return false;
                }
            }
        }

        let stored_at = Utc::now();
        let mut by_ttl: BTreeMap<Duration, Vec<(String, Vec<u8>)>> = BTreeMap::new();
        for (vkey, json, ttl) in prepared {
            let frame = entry::encode(stored_at, ttl, &json);
            self.inner.local.set(vkey.as_str(), json, stored_at, ttl);
            by_ttl
                .entry(ttl)
                .or_default()
                .push((vkey.as_str().to_string(), frame));
        }
        self.observe_local();

        if !self.remote_allowed() {
            self.record(CacheOp::Set, CacheOutcome::Stored);
            return true;
        }
        let mut ok = true;
        for (ttl, group) in by_ttl {
            let result = self.inner.remote.mset(group, ttl).await;
            if self.settle(CacheOp::Set, "mset", result).is_err() {
                ok = false;
            }
        }
        if ok {
            self.record(CacheOp::Set, CacheOutcome::Stored);
        }
        ok
    }

    /// Atomically add `delta` to a remote counter.
    ///
    /// The TTL is applied only when this call created the counter; later
    /// increments never extend it. Counters live only in the remote tier, so
    /// this returns `None` when it is unreachable.
    pub async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Option<i64> {
        let vkey = match self.versioned(key) {
            Ok(vkey) => vkey,
            Err(e) => {
                debug!(key, error = %e, "Rejected counter update");
                self.record(CacheOp::Incr, CacheOutcome::Rejected);
                return None;
            }
        };
        if !self.remote_allowed() {
            return None;
        }

        let ttl = self.resolve_ttl(key, ttl);
        let value = self
            .settle(
                CacheOp::Incr,
                key,
                self.inner.remote.incr_by(vkey.as_str(), delta, ttl).await,
            )
            .ok()?;
        self.record(CacheOp::Incr, CacheOutcome::Stored);
        Some(value)
    }

    // ========================================================================
    // DELETES
    // ========================================================================

    /// Remove a key from both tiers. Remote removal is best-effort. Returns
    /// true if either tier held the key.
    pub async fn del(&self, key: &str) -> bool {
        let Ok(vkey) = self.versioned(key) else {
            self.record(CacheOp::Delete, CacheOutcome::Rejected);
            return false;
        };
        let local_removed = self.inner.local.delete(vkey.as_str());

        let mut remote_removed = false;
        if self.remote_allowed() {
            let keys = [vkey.as_str().to_string()];
            if let Ok(n) = self.settle(CacheOp::Delete, key, self.inner.remote.delete(&keys).await) {
                remote_removed = n > 0;
            }
        }

        let removed = local_removed || remote_removed;
        if removed {
            self.record(CacheOp::Delete, CacheOutcome::Deleted);
        }
        removed
    }

    /// Delete every key matching a shell glob, in both tiers.
    ///
    /// Matching local entries are removed first and unconditionally. The
    /// remote pass runs under `budget` (default from config); if it runs out
    /// of time the report says `remaining: true` and the call can be
    /// repeated. Remote transport errors, including an open circuit,
    /// propagate.
    pub async fn invalidate(
        &self,
        pattern: &str,
        budget: Option<Duration>,
    ) -> ChamaResult<InvalidationReport> {
        GlobPattern::parse(pattern)?;
        let glob = GlobPattern::parse(&format!("{}:{}", self.inner.config.version, pattern))?;

        let local_removed = self.inner.local.remove_matching(&glob);
        self.observe_local();
        debug!(pattern, local_removed, "Local entries invalidated");

        if self.inner.circuit.is_open() {
            self.record(CacheOp::Invalidate, CacheOutcome::Error);
            return Err(TransportError::CircuitOpen.into());
        }

        let budget = budget.unwrap_or(self.inner.config.invalidation_time_budget);
        match self
            .inner
            .scanner
            .scan(self.inner.remote.as_ref(), &glob, budget)
            .await
        {
            Ok(report) => {
                self.inner.circuit.on_success();
                self.record(CacheOp::Invalidate, CacheOutcome::Deleted);
                Ok(report)
            }
            Err(e) => {
                if let ChamaError::Transport(t) = &e {
                    if t.is_connectivity() {
                        self.inner.circuit.on_failure();
                    }
                }
                self.record(CacheOp::Invalidate, CacheOutcome::Error);
                Err(e)
            }
        }
    }

    // ========================================================================
    // CACHE-ASIDE
    // ========================================================================

    /// Return the cached value, or compute it with `fetch` and cache it.
    ///
    /// Within this process `fetch` runs at most once per key at a time:
    /// concurrent callers for the same key wait for the first caller's
    /// computation and share its result or its error. Across processes an
    /// advisory remote lock makes duplicate computation unlikely. If the lock
    /// is held elsewhere the computation waits once for the configured retry
    /// delay, re-checks the cache and then proceeds without the lock.
    ///
    /// A value that serializes to JSON `null` is returned but not cached, and
    /// so is any value under a key that fails validation. Only `fetch`'s own
    /// error or a value that does not round-trip through JSON reaches the
    /// caller as an error.
    pub async fn get_or_set<T, F, Fut, E>(
        &self,
        key: &str,
        fetch: F,
        ttl: Option<Duration>,
    ) -> ChamaResult<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let vkey = match self.versioned(key) {
            Ok(vkey) => vkey,
            Err(e) => {
                warn!(key, error = %e, "Key not cacheable, fetching directly");
                self.record(CacheOp::Get, CacheOutcome::Rejected);
                return fetch().await.map_err(|e| {
                    warn!(key, error = %e, "Fetch failed");
                    ChamaError::fetch(e)
                });
            }
        };
        if let Some(value) = self.get::<T>(key).await {
            return Ok(value);
        }

        let flight_key = vkey.as_str().to_string();
        let (flight, role) = self.inner.pending.join_or_start(&flight_key, |guard| {
            let manager = self.clone();
            let key = key.to_string();
            async move {
                let _guard = guard;
                manager.compute(key, vkey, fetch, ttl).await
            }
            .boxed()
        });
        if role == FlightRole::Follower {
            debug!(key, "Joined in-flight computation");
        }

        let bytes = flight.await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Leader side of `get_or_set`. Runs on its own task.
    async fn compute<T, F, Fut, E>(
        &self,
        key: String,
        vkey: VersionedKey,
        fetch: F,
        ttl: Option<Duration>,
    ) -> FlightResult
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        if let Some(found) = self.lookup(&vkey, &Freshness::Ttl).await {
            return Ok(found.bytes);
        }

        let held = match self.acquire_lock(&vkey).await {
            LockAttempt::Acquired(held) => Some(held),
            LockAttempt::Contended => {
                tokio::time::sleep(self.inner.config.lock_retry_delay).await;
                if let Some(found) = self.lookup(&vkey, &Freshness::Ttl).await {
                    debug!(key = %key, "Value appeared while lock was held elsewhere");
                    return Ok(found.bytes);
                }
                debug!(key = %key, "Proceeding without lock");
                None
            }
            LockAttempt::Unavailable => None,
        };

        let result = self.fetch_and_store(&key, &vkey, fetch, ttl).await;
        self.release_lock(held).await;
        result
    }

    async fn fetch_and_store<T, F, Fut, E>(
        &self,
        key: &str,
        vkey: &VersionedKey,
        fetch: F,
        ttl: Option<Duration>,
    ) -> FlightResult
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let value = fetch().await.map_err(|e| {
            warn!(key, error = %e, "Fetch failed");
            ChamaError::fetch(e)
        })?;
        let json = serde_json::to_vec(&value)?;

        if json.as_slice() != JSON_NULL {
            let ttl = self.resolve_ttl(key, ttl);
            let stored = match self.check_value_size(json.len()) {
                Ok(()) => self.store(vkey, json.clone(), ttl).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = stored {
                warn!(key, error = %e, "Computed value not cached");
            }
        }
        Ok(Arc::new(json))
    }

    async fn acquire_lock(&self, vkey: &VersionedKey) -> LockAttempt {
        if !self.remote_allowed() {
            return LockAttempt::Unavailable;
        }
        let attempt = lock::try_acquire(
            self.inner.remote.as_ref(),
            vkey.lock_key(),
            self.inner.config.lock_ttl,
        )
        .await;
        match attempt {
            LockAttempt::Unavailable => self.inner.circuit.on_failure(),
            _ => self.inner.circuit.on_success(),
        }
        attempt
    }

    /// Release through the breaker. While the circuit is open the lock is
    /// left to its TTL.
    async fn release_lock(&self, held: Option<HeldLock>) {
        let Some(held) = held else { return };
        let lock_key = held.key().to_string();
        if !self.remote_allowed() {
            debug!(lock_key = %lock_key, "Circuit open, leaving lock to expire");
            return;
        }
        let released = held.release(self.inner.remote.as_ref()).await;
        let _ = self.settle(CacheOp::Set, &lock_key, released);
    }

    // ========================================================================
    // LIFECYCLE & INTROSPECTION
    // ========================================================================

    /// Snapshot of tier health.
    pub fn health(&self) -> CacheHealth {
        CacheHealth {
            remote_healthy: self.inner.remote.is_healthy(),
            circuit: self.inner.circuit.state(),
            local_items: self.inner.local.size(),
            local_bytes: self.inner.local.bytes(),
        }
    }

    /// Hit/miss counters and local tier occupancy.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            entry_count: self.inner.local.size() as u64,
            memory_bytes: self.inner.local.bytes() as u64,
            evictions: self.inner.local.evictions(),
        }
    }

    /// Drop the local tier. Remote entries are left to their TTLs.
    pub fn shutdown(&self) {
        self.inner.local.clear();
        self.observe_local();
        let stats = self.stats();
        info!(
            hits = stats.hits,
            misses = stats.misses,
            in_flight = self.inner.pending.len(),
            "Cache manager shut down"
        );
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn versioned(&self, key: &str) -> Result<VersionedKey, ValidationError> {
        if key.is_empty() {
            return Err(ValidationError::EmptyKey);
        }
        let vkey = VersionedKey::new(&self.inner.config.version, key);
        let max = self.inner.config.max_key_bytes;
        if vkey.len() > max {
            return Err(ValidationError::KeyTooLarge {
                size: vkey.len(),
                max,
            });
        }
        Ok(vkey)
    }

    /// Explicit TTL or the configured policy, capped at one year.
    fn resolve_ttl(&self, key: &str, ttl: Option<Duration>) -> Duration {
        ttl.unwrap_or_else(|| self.inner.config.ttl_for(key))
            .min(Duration::from_secs(MAX_TTL_SECS))
    }

    fn check_value_size(&self, size: usize) -> Result<(), ValidationError> {
        let max = self.inner.config.max_value_bytes;
        if size > max {
            return Err(ValidationError::ValueTooLarge { size, max });
        }
        Ok(())
    }

    /// Write already-validated JSON to both tiers.
    async fn store(&self, vkey: &VersionedKey, json: Vec<u8>, ttl: Duration) -> ChamaResult<()> {
        let stored_at = Utc::now();
        let frame = entry::encode(stored_at, ttl, &json);
        self.inner.local.set(vkey.as_str(), json, stored_at, ttl);
        self.observe_local();

        if !self.remote_allowed() {
            debug!(key = %vkey.logical(), "Circuit open, stored locally only");
            self.record(CacheOp::Set, CacheOutcome::Stored);
            return Ok(());
        }
        let result = self.inner.remote.set(vkey.as_str(), frame, ttl).await;
        self.settle(CacheOp::Set, vkey.logical(), result)?;
        self.record(CacheOp::Set, CacheOutcome::Stored);
        Ok(())
    }

    /// Local then remote lookup of raw JSON. Does not touch hit/miss
    /// counters.
    async fn lookup(&self, vkey: &VersionedKey, freshness: &Freshness) -> Option<Found> {
        if let Some(local) = self.inner.local.get(vkey.as_str()) {
            if freshness.accepts(local.stored_at) {
                return Some(Found {
                    bytes: local.value,
                    stored_at: local.stored_at,
                    tier: CacheTier::Local,
                });
            }
        }

        if !self.remote_allowed() {
            return None;
        }
        let raw = self
            .settle(
                CacheOp::Get,
                vkey.logical(),
                self.inner.remote.get(vkey.as_str()).await,
            )
            .ok()??;
        let Some(entry) = RemoteEntry::decode(&raw) else {
            warn!(key = %vkey.logical(), "Malformed remote entry");
            return None;
        };
        if !freshness.accepts(entry.stored_at) {
            return None;
        }
        self.populate_local(vkey, &entry);
        Some(Found {
            bytes: Arc::new(entry.payload.to_vec()),
            stored_at: entry.stored_at,
            tier: CacheTier::Remote,
        })
    }

    /// Copy a remote entry into the local tier for its remaining lifetime.
    fn populate_local(&self, vkey: &VersionedKey, entry: &RemoteEntry<'_>) {
        let remaining = entry.remaining_ttl();
        if !remaining.is_zero() {
            self.inner
                .local
                .set(vkey.as_str(), entry.payload.to_vec(), entry.stored_at, remaining);
            self.observe_local();
        }
    }

    fn remote_allowed(&self) -> bool {
        !self.inner.circuit.is_open()
    }

    /// Feed a remote outcome to the breaker, logging failures.
    fn settle<T>(&self, op: CacheOp, key: &str, result: RemoteResult<T>) -> RemoteResult<T> {
        match &result {
            Ok(_) => self.inner.circuit.on_success(),
            Err(e) => {
                if e.is_connectivity() {
                    self.inner.circuit.on_failure();
                }
                warn!(operation = %op, key, error = %e, "Remote tier call failed");
                self.record(op, CacheOutcome::Error);
            }
        }
        result
    }

    fn record(&self, op: CacheOp, outcome: CacheOutcome) {
        self.inner.metrics.record(op, outcome);
    }

    fn observe_local(&self) {
        self.inner
            .metrics
            .observe_local(self.inner.local.size(), self.inner.local.bytes());
    }
}

impl<R: RemoteStore> std::fmt::Debug for CacheManager<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("version", &self.inner.config.version)
            .field("circuit", &self.inner.circuit.state())
            .field("local", &self.inner.local)
            .finish()
    }
}

/// Raw lookup result.
struct Found {
    bytes: Arc<Vec<u8>>,
    stored_at: DateTime<Utc>,
    tier: CacheTier,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory_backend::InMemoryRemoteStore;
    use chama_core::CircuitBreakerConfig;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingMetrics {
        events: Mutex<Vec<(CacheOp, CacheOutcome)>>,
    }

    impl RecordingMetrics {
        fn count(&self, op: CacheOp, outcome: CacheOutcome) -> usize {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| **e == (op, outcome))
                .count()
        }
    }

    impl CacheMetrics for RecordingMetrics {
        fn record(&self, op: CacheOp, outcome: CacheOutcome) {
            self.events.lock().unwrap().push((op, outcome));
        }
    }

    fn manager() -> (CacheManager<InMemoryRemoteStore>, Arc<InMemoryRemoteStore>) {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let manager = CacheManager::new(CacheConfig::default(), Arc::clone(&remote)).unwrap();
        (manager, remote)
    }

    #[tokio::test]
    async fn test_keys_are_versioned_in_remote() {
        let (cache, remote) = manager();
        assert!(cache.set("stats", &5u32, None).await);
        assert_eq!(remote.keys(), vec!["v1:stats".to_string()]);
    }

    #[tokio::test]
    async fn test_remote_hit_populates_local() {
        let (writer, remote) = manager();
        writer.set("members", &vec!["wanjiru", "otieno"], None).await;

        let reader = CacheManager::new(CacheConfig::default(), Arc::clone(&remote)).unwrap();
        let read = reader
            .get_with::<Vec<String>>("members", Freshness::Ttl)
            .await
            .unwrap();
        assert_eq!(read.tier(), CacheTier::Remote);

        let again = reader
            .get_with::<Vec<String>>("members", Freshness::Ttl)
            .await
            .unwrap();
        assert_eq!(again.tier(), CacheTier::Local);
        assert_eq!(again.into_value(), vec!["wanjiru", "otieno"]);
    }

    #[tokio::test]
    async fn test_best_effort_rejects_old_entries_in_both_tiers() {
        let (cache, _) = manager();
        cache.set("stats", &1u8, None).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let strict = Freshness::best_effort(Duration::from_millis(1));
        assert!(cache.get_with::<u8>("stats", strict).await.is_none());
        let loose = Freshness::best_effort(Duration::from_secs(60));
        assert!(cache.get_with::<u8>("stats", loose).await.is_some());
    }

    #[tokio::test]
    async fn test_type_mismatch_reads_as_miss() {
        let (cache, _) = manager();
        cache.set("stats", &"text", None).await;
        assert_eq!(cache.get::<u64>("stats").await, None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_invalid_keys() {
        let (cache, remote) = manager();
        assert!(!cache.set("", &1u8, None).await);
        let long = "k".repeat(2000);
        let err = cache.try_set(&long, &1u8, None).await.unwrap_err();
        assert!(matches!(
            err,
            ChamaError::Validation(ValidationError::KeyTooLarge { .. })
        ));
        assert_eq!(cache.get::<u8>(&long).await, None);
        assert_eq!(remote.call_count(), 0);
    }

    #[tokio::test]
    async fn test_ttl_policy_applies_when_ttl_omitted() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let config = CacheConfig::default()
            .with_ttl_override("chama:", Duration::from_millis(30))
            .with_default_ttl(Duration::from_secs(60));
        let cache = CacheManager::new(config, Arc::clone(&remote)).unwrap();

        cache.set("chama:1:dashboard", &1u8, None).await;
        cache.set("reports:monthly", &2u8, None).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(cache.get::<u8>("chama:1:dashboard").await, None);
        assert_eq!(cache.get::<u8>("reports:monthly").await, Some(2));
    }

    #[tokio::test]
    async fn test_mget_mixes_tiers() {
        let (writer, remote) = manager();
        writer.set("a", &1i32, None).await;
        writer.set("b", &2i32, None).await;

        let reader = CacheManager::new(CacheConfig::default(), Arc::clone(&remote)).unwrap();
        reader.set("c", &3i32, None).await;

        let values = reader.mget::<i32>(&["a", "missing", "c", "b", ""]).await;
        assert_eq!(values, vec![Some(1), None, Some(3), Some(2), None]);
    }

    #[tokio::test]
    async fn test_mset_is_all_or_nothing() {
        let config = CacheConfig::default().with_max_value_bytes(16);
        let remote = Arc::new(InMemoryRemoteStore::new());
        let cache = CacheManager::new(config, Arc::clone(&remote)).unwrap();

        let ok = cache
            .mset(&[("a", "x".to_string()), ("b", "y".repeat(64))], None)
            .await;
        assert!(!ok);
        assert!(remote.keys().is_empty());
        assert_eq!(cache.get::<String>("a").await, None);

        assert!(cache.mset(&[("a", "x".to_string()), ("b", "y".to_string())], None).await);
        assert_eq!(cache.get::<String>("b").await.as_deref(), Some("y"));
        assert_eq!(remote.keys().len(), 2);
    }

    #[tokio::test]
    async fn test_incr_and_counter() {
        let (cache, remote) = manager();
        assert_eq!(cache.incr("logins", 1, Some(Duration::from_secs(60))).await, Some(1));
        assert_eq!(cache.incr("logins", 4, None).await, Some(5));
        assert_eq!(cache.counter("logins").await, Some(5));
        assert!(remote.contains("v1:logins"));

        remote.set_available(false);
        assert_eq!(cache.incr("logins", 1, None).await, None);
        assert_eq!(cache.counter("logins").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_seeds_ttl_once() {
        let (cache, remote) = manager();
        cache.incr("hits", 1, Some(Duration::from_secs(10))).await;
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.incr("hits", 1, Some(Duration::from_secs(10))).await;
        tokio::time::advance(Duration::from_secs(5)).await;
        // The second increment did not extend the original expiry.
        assert!(!remote.contains("v1:hits"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_back_to_delta_keeps_original_expiry() {
        let (cache, remote) = manager();
        let ttl = Some(Duration::from_secs(10));
        assert_eq!(cache.incr("votes", 3, ttl).await, Some(3));
        assert_eq!(cache.incr("votes", -3, None).await, Some(0));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.incr("votes", 3, ttl).await, Some(3));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!remote.contains("v1:votes"));

        assert_eq!(cache.incr("zero", 0, ttl).await, Some(0));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.incr("zero", 0, ttl).await, Some(0));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!remote.contains("v1:zero"));
    }

    #[tokio::test]
    async fn test_huge_ttl_is_capped() {
        let (cache, remote) = manager();
        let forever = Some(Duration::from_secs(u64::MAX));
        assert!(cache.set("k", &1u8, forever).await);
        assert_eq!(cache.get::<u8>("k").await, Some(1));
        assert!(cache.mset(&[("a", 1u8), ("b", 2u8)], forever).await);
        assert_eq!(cache.incr("n", 1, forever).await, Some(1));
        let fetched: u8 = cache
            .get_or_set("computed", || async { Ok::<_, std::io::Error>(9) }, forever)
            .await
            .unwrap();
        assert_eq!(fetched, 9);
        assert!(remote.contains("v1:computed"));
    }

    #[tokio::test]
    async fn test_del_removes_both_tiers() {
        let (cache, remote) = manager();
        cache.set("k", &1u8, None).await;
        assert!(cache.del("k").await);
        assert!(!remote.contains("v1:k"));
        assert_eq!(cache.get::<u8>("k").await, None);
        assert!(!cache.del("k").await);
    }

    #[tokio::test]
    async fn test_del_during_outage_still_clears_local() {
        let (cache, remote) = manager();
        cache.set("k", &1u8, None).await;
        remote.set_available(false);
        assert!(cache.del("k").await);
        assert_eq!(cache.health().local_items, 0);
    }

    #[tokio::test]
    async fn test_invalidate_rejects_empty_pattern() {
        let (cache, _) = manager();
        let err = cache.invalidate("", None).await.unwrap_err();
        assert!(matches!(
            err,
            ChamaError::Validation(ValidationError::InvalidPattern { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalidate_with_open_circuit_clears_local_and_errors() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let config = CacheConfig::default().with_circuit(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(60),
        });
        let cache = CacheManager::new(config, Arc::clone(&remote)).unwrap();
        cache.set("chama:1:members", &1u8, None).await;

        remote.set_available(false);
        assert_eq!(cache.get::<u8>("chama:2:members").await, None);
        assert_eq!(cache.circuit_state(), CircuitState::Open);

        let err = cache.invalidate("chama:1:*", None).await.unwrap_err();
        assert!(matches!(err, ChamaError::Transport(TransportError::CircuitOpen)));
        assert_eq!(cache.health().local_items, 0);
    }

    #[tokio::test]
    async fn test_metrics_outcomes() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let metrics = Arc::new(RecordingMetrics::default());
        let cache =
            CacheManager::with_metrics(CacheConfig::default(), remote, metrics.clone()).unwrap();

        cache.set("k", &1u8, None).await;
        cache.get::<u8>("k").await;
        cache.get::<u8>("absent").await;
        cache.set("", &1u8, None).await;

        assert_eq!(metrics.count(CacheOp::Set, CacheOutcome::Stored), 1);
        assert_eq!(metrics.count(CacheOp::Get, CacheOutcome::HitLocal), 1);
        assert_eq!(metrics.count(CacheOp::Get, CacheOutcome::Miss), 1);
        assert_eq!(metrics.count(CacheOp::Set, CacheOutcome::Rejected), 1);
    }

    #[tokio::test]
    async fn test_null_fetch_result_is_not_cached() {
        let (cache, remote) = manager();
        let value: Option<u32> = cache
            .get_or_set("maybe", || async { Ok::<_, std::io::Error>(None) }, None)
            .await
            .unwrap();
        assert_eq!(value, None);
        assert!(!remote.contains("v1:maybe"));
    }

    #[tokio::test]
    async fn test_oversized_fetch_result_is_returned_uncached() {
        let config = CacheConfig::default().with_max_value_bytes(8);
        let remote = Arc::new(InMemoryRemoteStore::new());
        let cache = CacheManager::new(config, Arc::clone(&remote)).unwrap();

        let big = "x".repeat(100);
        let expected = big.clone();
        let value: String = cache
            .get_or_set("big", move || async move { Ok::<_, std::io::Error>(big) }, None)
            .await
            .unwrap();
        assert_eq!(value, expected);
        assert!(!remote.contains("v1:big"));
        assert_eq!(cache.health().local_items, 0);
    }

    #[tokio::test]
    async fn test_uncacheable_key_fetches_directly() {
        let (cache, remote) = manager();
        let long = "k".repeat(2000);
        let value: u8 = cache
            .get_or_set(&long, || async { Ok::<_, std::io::Error>(7) }, None)
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(remote.call_count(), 0);
        assert_eq!(cache.pending_fetches(), 0);

        let err = cache
            .get_or_set::<u8, _, _, _>(
                "",
                || async { Err(std::io::Error::other("db down")) },
                None,
            )
            .await
            .unwrap_err();
        assert!(err.is_fetch());
    }

    #[tokio::test]
    async fn test_lock_left_to_expire_when_circuit_opens_mid_fetch() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let config = CacheConfig::default().with_circuit(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(60),
        });
        let cache = CacheManager::new(config, Arc::clone(&remote)).unwrap();

        let outage = Arc::clone(&remote);
        let calls_at_fetch = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&calls_at_fetch);
        let value: u8 = cache
            .get_or_set(
                "k",
                move || async move {
                    outage.set_available(false);
                    seen.store(outage.call_count(), Ordering::SeqCst);
                    Ok::<_, std::io::Error>(4)
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(value, 4);
        assert_eq!(cache.circuit_state(), CircuitState::Open);
        // Only the failed write reached the remote tier after the fetch.
        assert_eq!(remote.call_count(), calls_at_fetch.load(Ordering::SeqCst) + 1);
        assert!(remote.contains("lock:v1:k"));
    }

    #[tokio::test]
    async fn test_lock_is_released_after_fetch() {
        let (cache, remote) = manager();
        let _: u8 = cache
            .get_or_set("k", || async { Ok::<_, std::io::Error>(7) }, None)
            .await
            .unwrap();
        assert!(!remote.contains("lock:v1:k"));
        assert_eq!(cache.pending_fetches(), 0);
    }

    #[tokio::test]
    async fn test_health_report() {
        let (cache, remote) = manager();
        cache.set("k", &1u8, None).await;
        let health = cache.health();
        assert!(health.is_fully_operational());
        assert_eq!(health.local_items, 1);
        assert!(health.to_health_check().is_operational());

        remote.set_available(false);
        let check = cache.health().to_health_check();
        assert_eq!(check.status, chama_core::HealthStatus::Degraded);
        assert!(check.is_operational());
    }

    #[tokio::test]
    async fn test_shutdown_clears_local_only() {
        let (cache, remote) = manager();
        cache.set("k", &1u8, None).await;
        cache.shutdown();
        assert_eq!(cache.health().local_items, 0);
        assert!(remote.contains("v1:k"));
    }
}
