//! Configuration types
//!
//! Configuration is loaded from environment variables with sensible defaults
//! for development, or assembled with the `with_*` builders. Call
//! [`CacheConfig::validate`] before handing a config to the cache manager.

use crate::constants::*;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Characters that would change the meaning of a key pattern.
const RESERVED_VERSION_CHARS: &[char] = &['*', '?', '[', ']', '\\', ':'];

// ============================================================================
// REMOTE STORE
// ============================================================================

/// Connection parameters for the remote tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// How long to wait when establishing a connection
    pub connect_timeout: Duration,
    /// How long a single command may take
    pub operation_timeout: Duration,
    /// Attempts per command, first try included
    pub max_attempts: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
            max_attempts: DEFAULT_REMOTE_MAX_ATTEMPTS,
        }
    }
}

impl RemoteConfig {
    /// Create RemoteConfig from environment variables.
    ///
    /// - `CHAMA_REDIS_URL`: connection URL (default: redis://127.0.0.1:6379)
    /// - `CHAMA_REDIS_CONNECT_TIMEOUT_MS`: connect timeout (default: 2000)
    /// - `CHAMA_REDIS_OPERATION_TIMEOUT_MS`: per-command timeout (default: 1000)
    /// - `CHAMA_REDIS_MAX_ATTEMPTS`: attempts per command (default: 2)
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("CHAMA_REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string()),
            connect_timeout: Duration::from_millis(env_or(
                "CHAMA_REDIS_CONNECT_TIMEOUT_MS",
                DEFAULT_CONNECT_TIMEOUT_MS,
            )),
            operation_timeout: Duration::from_millis(env_or(
                "CHAMA_REDIS_OPERATION_TIMEOUT_MS",
                DEFAULT_OPERATION_TIMEOUT_MS,
            )),
            max_attempts: env_or("CHAMA_REDIS_MAX_ATTEMPTS", DEFAULT_REMOTE_MAX_ATTEMPTS),
        }
    }
}

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Configuration for the remote-tier circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_CIRCUIT_SUCCESS_THRESHOLD,
            reset_timeout: Duration::from_secs(DEFAULT_CIRCUIT_RESET_TIMEOUT_SECS),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create CircuitBreakerConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `CHAMA_CIRCUIT_FAILURE_THRESHOLD`: failures before opening (default: 5)
    /// - `CHAMA_CIRCUIT_SUCCESS_THRESHOLD`: successes to close from half-open (default: 1)
    /// - `CHAMA_CIRCUIT_RESET_TIMEOUT_SECS`: how long the circuit stays open (default: 30)
    pub fn from_env() -> Self {
        Self {
            failure_threshold: env_or(
                "CHAMA_CIRCUIT_FAILURE_THRESHOLD",
                DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
            ),
            success_threshold: env_or(
                "CHAMA_CIRCUIT_SUCCESS_THRESHOLD",
                DEFAULT_CIRCUIT_SUCCESS_THRESHOLD,
            ),
            reset_timeout: Duration::from_secs(env_or(
                "CHAMA_CIRCUIT_RESET_TIMEOUT_SECS",
                DEFAULT_CIRCUIT_RESET_TIMEOUT_SECS,
            )),
        }
    }
}

// ============================================================================
// TTL POLICY
// ============================================================================

/// TTL applied to every logical key starting with `prefix`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlOverride {
    pub prefix: String,
    pub ttl: Duration,
}

/// Parse `prefix=secs,prefix=secs` into overrides. Malformed pairs are skipped.
fn parse_ttl_overrides(raw: &str) -> Vec<TtlOverride> {
    raw.split(',')
        .filter_map(|pair| {
            let (prefix, secs) = pair.split_once('=')?;
            let prefix = prefix.trim();
            if prefix.is_empty() {
                return None;
            }
            let secs: u64 = secs.trim().parse().ok()?;
            Some(TtlOverride {
                prefix: prefix.to_string(),
                ttl: Duration::from_secs(secs),
            })
        })
        .collect()
}

// ============================================================================
// CACHE CONFIGURATION
// ============================================================================

/// Configuration surface for the cache manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Version prefix for every key. Changing it orphans all prior entries.
    pub version: String,

    // Local tier
    pub local_max_items: usize,
    pub local_max_bytes: usize,

    // TTLs
    pub default_ttl: Duration,
    pub ttl_overrides: Vec<TtlOverride>,

    // Entry limits
    pub max_key_bytes: usize,
    pub max_value_bytes: usize,

    // Stampede protection
    pub lock_ttl: Duration,
    pub lock_retry_delay: Duration,

    // Invalidation
    pub scan_batch_size: usize,
    pub scan_yield_every: usize,
    pub invalidation_time_budget: Duration,

    pub remote: RemoteConfig,
    pub circuit: CircuitBreakerConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_CACHE_VERSION.to_string(),
            local_max_items: DEFAULT_LOCAL_MAX_ITEMS,
            local_max_bytes: DEFAULT_LOCAL_MAX_BYTES,
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            ttl_overrides: Vec::new(),
            max_key_bytes: MAX_KEY_BYTES,
            max_value_bytes: DEFAULT_MAX_VALUE_BYTES,
            lock_ttl: Duration::from_millis(DEFAULT_LOCK_TTL_MS),
            lock_retry_delay: Duration::from_millis(DEFAULT_LOCK_RETRY_DELAY_MS),
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
            scan_yield_every: DEFAULT_SCAN_YIELD_EVERY,
            invalidation_time_budget: Duration::from_millis(DEFAULT_INVALIDATION_BUDGET_MS),
            remote: RemoteConfig::default(),
            circuit: CircuitBreakerConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create CacheConfig from environment variables.
    ///
    /// Environment variables (all optional):
    /// - `CHAMA_CACHE_VERSION`
    /// - `CHAMA_CACHE_LOCAL_MAX_ITEMS`, `CHAMA_CACHE_LOCAL_MAX_BYTES`
    /// - `CHAMA_CACHE_DEFAULT_TTL_SECS`
    /// - `CHAMA_CACHE_TTL_OVERRIDES`: `prefix=secs` pairs, comma-separated
    /// - `CHAMA_CACHE_MAX_VALUE_BYTES`
    /// - `CHAMA_CACHE_LOCK_TTL_MS`, `CHAMA_CACHE_LOCK_RETRY_DELAY_MS`
    /// - `CHAMA_CACHE_SCAN_BATCH_SIZE`, `CHAMA_CACHE_SCAN_YIELD_EVERY`
    /// - `CHAMA_CACHE_INVALIDATION_BUDGET_MS`
    /// - plus everything read by [`RemoteConfig::from_env`] and
    ///   [`CircuitBreakerConfig::from_env`]
    pub fn from_env() -> Self {
        let ttl_overrides = std::env::var("CHAMA_CACHE_TTL_OVERRIDES")
            .ok()
            .map(|raw| parse_ttl_overrides(&raw))
            .unwrap_or_default();

        Self {
            version: std::env::var("CHAMA_CACHE_VERSION")
                .unwrap_or_else(|_| DEFAULT_CACHE_VERSION.to_string()),
            local_max_items: env_or("CHAMA_CACHE_LOCAL_MAX_ITEMS", DEFAULT_LOCAL_MAX_ITEMS),
            local_max_bytes: env_or("CHAMA_CACHE_LOCAL_MAX_BYTES", DEFAULT_LOCAL_MAX_BYTES),
            default_ttl: Duration::from_secs(env_or("CHAMA_CACHE_DEFAULT_TTL_SECS", DEFAULT_TTL_SECS)),
            ttl_overrides,
            max_key_bytes: MAX_KEY_BYTES,
            max_value_bytes: env_or("CHAMA_CACHE_MAX_VALUE_BYTES", DEFAULT_MAX_VALUE_BYTES),
            lock_ttl: Duration::from_millis(env_or("CHAMA_CACHE_LOCK_TTL_MS", DEFAULT_LOCK_TTL_MS)),
            lock_retry_delay: Duration::from_millis(env_or(
                "CHAMA_CACHE_LOCK_RETRY_DELAY_MS",
                DEFAULT_LOCK_RETRY_DELAY_MS,
            )),
            scan_batch_size: env_or("CHAMA_CACHE_SCAN_BATCH_SIZE", DEFAULT_SCAN_BATCH_SIZE),
            scan_yield_every: env_or("CHAMA_CACHE_SCAN_YIELD_EVERY", DEFAULT_SCAN_YIELD_EVERY),
            invalidation_time_budget: Duration::from_millis(env_or(
                "CHAMA_CACHE_INVALIDATION_BUDGET_MS",
                DEFAULT_INVALIDATION_BUDGET_MS,
            )),
            remote: RemoteConfig::from_env(),
            circuit: CircuitBreakerConfig::from_env(),
        }
    }

    /// Set the version prefix.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the local tier item and byte budgets.
    pub fn with_local_limits(mut self, max_items: usize, max_bytes: usize) -> Self {
        self.local_max_items = max_items;
        self.local_max_bytes = max_bytes;
        self
    }

    /// Set the default TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Add a TTL override for every key starting with `prefix`.
    pub fn with_ttl_override(mut self, prefix: impl Into<String>, ttl: Duration) -> Self {
        self.ttl_overrides.push(TtlOverride {
            prefix: prefix.into(),
            ttl,
        });
        self
    }

    /// Set the maximum serialized value size.
    pub fn with_max_value_bytes(mut self, max: usize) -> Self {
        self.max_value_bytes = max;
        self
    }

    /// Set the advisory lock TTL and contended-lock retry delay.
    pub fn with_lock_timing(mut self, ttl: Duration, retry_delay: Duration) -> Self {
        self.lock_ttl = ttl;
        self.lock_retry_delay = retry_delay;
        self
    }

    /// Set scan batching for invalidation.
    pub fn with_scan_batching(mut self, batch_size: usize, yield_every: usize) -> Self {
        self.scan_batch_size = batch_size;
        self.scan_yield_every = yield_every;
        self
    }

    /// Set the default invalidation time budget.
    pub fn with_invalidation_budget(mut self, budget: Duration) -> Self {
        self.invalidation_time_budget = budget;
        self
    }

    /// Set the remote connection parameters.
    pub fn with_remote(mut self, remote: RemoteConfig) -> Self {
        self.remote = remote;
        self
    }

    /// Set the circuit breaker parameters.
    pub fn with_circuit(mut self, circuit: CircuitBreakerConfig) -> Self {
        self.circuit = circuit;
        self
    }

    /// Resolve the TTL for a logical key: longest matching override prefix,
    /// otherwise the default TTL.
    pub fn ttl_for(&self, key: &str) -> Duration {
        self.ttl_overrides
            .iter()
            .filter(|o| key.starts_with(o.prefix.as_str()))
            .max_by_key(|o| o.prefix.len())
            .map(|o| o.ttl)
            .unwrap_or(self.default_ttl)
    }

    /// Check the configuration for values the cache cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "version".to_string(),
            });
        }
        if self.version.contains(RESERVED_VERSION_CHARS) {
            return Err(invalid(
                "version",
                &self.version,
                "must not contain glob characters or ':'",
            ));
        }
        if self.local_max_items == 0 {
            return Err(invalid("local_max_items", "0", "must be positive"));
        }
        if self.max_value_bytes == 0 {
            return Err(invalid("max_value_bytes", "0", "must be positive"));
        }
        if self.max_value_bytes > self.local_max_bytes {
            return Err(invalid(
                "max_value_bytes",
                &self.max_value_bytes.to_string(),
                "must not exceed local_max_bytes",
            ));
        }
        if self.max_key_bytes == 0 || self.max_key_bytes > MAX_KEY_BYTES {
            return Err(invalid(
                "max_key_bytes",
                &self.max_key_bytes.to_string(),
                "must be between 1 and 1024",
            ));
        }
        let max_ttl = Duration::from_secs(MAX_TTL_SECS);
        if self.default_ttl.is_zero() {
            return Err(invalid("default_ttl", "0", "must be positive"));
        }
        if self.default_ttl > max_ttl {
            return Err(invalid(
                "default_ttl",
                &self.default_ttl.as_secs().to_string(),
                "must not exceed one year",
            ));
        }
        if let Some(o) = self.ttl_overrides.iter().find(|o| o.ttl > max_ttl) {
            return Err(invalid(
                "ttl_overrides",
                &o.prefix,
                "TTL must not exceed one year",
            ));
        }
        if self.lock_ttl.is_zero() {
            return Err(invalid("lock_ttl", "0", "must be positive"));
        }
        if self.lock_ttl > max_ttl {
            return Err(invalid(
                "lock_ttl",
                &self.lock_ttl.as_millis().to_string(),
                "must not exceed one year",
            ));
        }
        if self.scan_batch_size == 0 {
            return Err(invalid("scan_batch_size", "0", "must be positive"));
        }
        if self.scan_yield_every == 0 {
            return Err(invalid("scan_yield_every", "0", "must be positive"));
        }
        if self.remote.url.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "remote.url".to_string(),
            });
        }
        if self.remote.max_attempts == 0 {
            return Err(invalid("remote.max_attempts", "0", "must be positive"));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(invalid("circuit.failure_threshold", "0", "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EnvVarGuard {
        key: &'static str,
        original: Option<String>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: Option<&str>) -> Self {
            let original = std::env::var(key).ok();
            match value {
                Some(v) => std::env::set_var(key, v),
                None => std::env::remove_var(key),
            }
            Self { key, original }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match self.original.as_deref() {
                Some(v) => std::env::set_var(self.key, v),
                None => std::env::remove_var(self.key),
            }
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::new()
            .with_version("v7")
            .with_local_limits(50, 4096)
            .with_default_ttl(Duration::from_secs(60))
            .with_max_value_bytes(1024)
            .with_lock_timing(Duration::from_secs(3), Duration::from_millis(20))
            .with_scan_batching(25, 4)
            .with_invalidation_budget(Duration::from_millis(750));

        assert_eq!(config.version, "v7");
        assert_eq!(config.local_max_items, 50);
        assert_eq!(config.local_max_bytes, 4096);
        assert_eq!(config.default_ttl, Duration::from_secs(60));
        assert_eq!(config.max_value_bytes, 1024);
        assert_eq!(config.lock_ttl, Duration::from_secs(3));
        assert_eq!(config.lock_retry_delay, Duration::from_millis(20));
        assert_eq!(config.scan_batch_size, 25);
        assert_eq!(config.scan_yield_every, 4);
        assert_eq!(config.invalidation_time_budget, Duration::from_millis(750));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ttl_for_prefers_longest_prefix() {
        let config = CacheConfig::new()
            .with_default_ttl(Duration::from_secs(300))
            .with_ttl_override("chama:", Duration::from_secs(120))
            .with_ttl_override("chama:42:dashboard", Duration::from_secs(30));

        assert_eq!(config.ttl_for("chama:42:dashboard"), Duration::from_secs(30));
        assert_eq!(config.ttl_for("chama:42:members"), Duration::from_secs(120));
        assert_eq!(config.ttl_for("reports:monthly"), Duration::from_secs(300));
    }

    #[test]
    fn test_validate_rejects_glob_in_version() {
        let err = CacheConfig::new().with_version("v*").validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "version"));

        let err = CacheConfig::new().with_version("a:b").validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_validate_rejects_ttl_above_ceiling() {
        let err = CacheConfig::new()
            .with_default_ttl(Duration::from_secs(u64::MAX))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "default_ttl"));

        let err = CacheConfig::new()
            .with_ttl_override("chama:", Duration::from_secs(MAX_TTL_SECS + 1))
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "ttl_overrides"));

        let at_ceiling = CacheConfig::new().with_default_ttl(Duration::from_secs(MAX_TTL_SECS));
        assert!(at_ceiling.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_version() {
        let err = CacheConfig::new().with_version("").validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn test_validate_rejects_value_limit_above_local_budget() {
        let err = CacheConfig::new()
            .with_local_limits(10, 512)
            .with_max_value_bytes(1024)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "max_value_bytes"));
    }

    #[test]
    fn test_parse_ttl_overrides_skips_malformed_pairs() {
        let parsed = parse_ttl_overrides("chama:=60, bad, stats:=abc,=5,members:=15");
        assert_eq!(
            parsed,
            vec![
                TtlOverride {
                    prefix: "chama:".to_string(),
                    ttl: Duration::from_secs(60)
                },
                TtlOverride {
                    prefix: "members:".to_string(),
                    ttl: Duration::from_secs(15)
                },
            ]
        );
    }

    #[test]
    fn test_from_env_reads_overrides() {
        let _version = EnvVarGuard::set("CHAMA_CACHE_VERSION", Some("v9"));
        let _items = EnvVarGuard::set("CHAMA_CACHE_LOCAL_MAX_ITEMS", Some("123"));
        let _threshold = EnvVarGuard::set("CHAMA_CIRCUIT_FAILURE_THRESHOLD", Some("not-a-number"));

        let config = CacheConfig::from_env();
        assert_eq!(config.version, "v9");
        assert_eq!(config.local_max_items, 123);
        assert_eq!(
            config.circuit.failure_threshold,
            DEFAULT_CIRCUIT_FAILURE_THRESHOLD
        );
    }
}
