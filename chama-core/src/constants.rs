//! Constants for the chama cache
//!
//! Centralizing defaults makes them easy to find, modify, and test.

// ============================================================================
// KEYS & VALUES
// ============================================================================

/// Hard ceiling on the size of a versioned cache key (1 KiB)
pub const MAX_KEY_BYTES: usize = 1024;

/// Default ceiling on a serialized cache value (1 MiB)
pub const DEFAULT_MAX_VALUE_BYTES: usize = 1024 * 1024;

/// Default cache version prefix
pub const DEFAULT_CACHE_VERSION: &str = "v1";

/// Prefix for distributed lock keys
pub const LOCK_KEY_PREFIX: &str = "lock";

// ============================================================================
// LOCAL TIER
// ============================================================================

/// Default maximum number of entries held in process
pub const DEFAULT_LOCAL_MAX_ITEMS: usize = 10_000;

/// Default byte budget for the in-process tier (64 MiB)
pub const DEFAULT_LOCAL_MAX_BYTES: usize = 64 * 1024 * 1024;

/// Default entry TTL in seconds (5 minutes)
pub const DEFAULT_TTL_SECS: u64 = 300;

/// Longest TTL any entry or counter is given (one year). Longer requests
/// are clamped.
pub const MAX_TTL_SECS: u64 = 365 * 24 * 60 * 60;

// ============================================================================
// STAMPEDE PROTECTION
// ============================================================================

/// Default advisory lock TTL in milliseconds
pub const DEFAULT_LOCK_TTL_MS: u64 = 10_000;

/// Default wait before re-checking the cache when the lock is contended
pub const DEFAULT_LOCK_RETRY_DELAY_MS: u64 = 100;

// ============================================================================
// INVALIDATION
// ============================================================================

/// Default number of keys per scan page and per delete call
pub const DEFAULT_SCAN_BATCH_SIZE: usize = 100;

/// Default number of delete batches between cooperative yields
pub const DEFAULT_SCAN_YIELD_EVERY: usize = 10;

/// Default time budget for a single invalidation pass in milliseconds
pub const DEFAULT_INVALIDATION_BUDGET_MS: u64 = 5_000;

// ============================================================================
// REMOTE TIER
// ============================================================================

/// Default Redis URL
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default connect timeout in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;

/// Default per-command timeout in milliseconds
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 1_000;

/// Default number of attempts per remote command (first try included)
pub const DEFAULT_REMOTE_MAX_ATTEMPTS: u32 = 2;

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Consecutive failures before the circuit opens
pub const DEFAULT_CIRCUIT_FAILURE_THRESHOLD: u32 = 5;

/// Successes needed in half-open before the circuit closes
pub const DEFAULT_CIRCUIT_SUCCESS_THRESHOLD: u32 = 1;

/// How long the circuit stays open before probing, in seconds
pub const DEFAULT_CIRCUIT_RESET_TIMEOUT_SECS: u64 = 30;
