//! Redis-backed remote store.
//!
//! Callers hold a [`RedisRemoteStore`] facade. The multiplexed connection
//! inside it is created lazily, dropped on connectivity errors, and swapped
//! for a fresh one on the next command. Health is tracked in an atomic flag
//! updated on every connect, disconnect and command outcome.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chama_core::constants::MAX_TTL_SECS;
use chama_core::{ChamaResult, ConfigError, RemoteConfig, TransportError};
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, RedisResult, Script};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::traits::{RemoteResult, RemoteStore};

/// Deletes KEYS[1] only if it holds ARGV[1].
const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Adds ARGV[1] to KEYS[1], creating it at zero with a PX of ARGV[2] first.
const INCR_WITH_EXPIRY_SCRIPT: &str = r#"
redis.call("SET", KEYS[1], "0", "NX", "PX", ARGV[2])
return redis.call("INCRBY", KEYS[1], ARGV[1])
"#;

/// Remote store over a single multiplexed Redis connection.
pub struct RedisRemoteStore {
    client: Client,
    conn: RwLock<Option<MultiplexedConnection>>,
    healthy: AtomicBool,
    release_script: Script,
    incr_script: Script,
    config: RemoteConfig,
}

impl RedisRemoteStore {
    /// Create a store without connecting. The first command connects.
    pub fn new(config: RemoteConfig) -> ChamaResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| ConfigError::InvalidValue {
            field: "remote.url".to_string(),
            value: config.url.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            client,
            conn: RwLock::new(None),
            healthy: AtomicBool::new(false),
            release_script: Script::new(COMPARE_AND_DELETE_SCRIPT),
            incr_script: Script::new(INCR_WITH_EXPIRY_SCRIPT),
            config,
        })
    }

    /// Create a store and connect eagerly.
    ///
    /// An unreachable server is not an error: the store starts unhealthy and
    /// keeps trying to reconnect on later commands.
    pub async fn connect(config: RemoteConfig) -> ChamaResult<Self> {
        let store = Self::new(config)?;
        if let Err(e) = store.reconnect().await {
            warn!(error = %e, url = %store.config.url, "Redis unreachable at startup, starting degraded");
        }
        Ok(store)
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Current connection handle, connecting if there is none.
    async fn connection(&self) -> RemoteResult<MultiplexedConnection> {
        if let Some(conn) = self.conn.read().await.as_ref() {
            return Ok(conn.clone());
        }
        self.reconnect().await
    }

    /// Open a fresh connection and swap it in.
    async fn reconnect(&self) -> RemoteResult<MultiplexedConnection> {
        let mut slot = self.conn.write().await;
        // Another task may have reconnected while we waited for the lock.
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let attempt = tokio::time::timeout(
            self.config.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await;

        match attempt {
            Ok(Ok(conn)) => {
                *slot = Some(conn.clone());
                if !self.healthy.swap(true, Ordering::SeqCst) {
                    info!(url = %self.config.url, "Connected to Redis");
                }
                Ok(conn)
            }
            Ok(Err(e)) => {
                self.healthy.store(false, Ordering::SeqCst);
                Err(TransportError::Unavailable {
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                self.healthy.store(false, Ordering::SeqCst);
                Err(TransportError::Timeout {
                    command: "CONNECT".to_string(),
                    after: self.config.connect_timeout,
                })
            }
        }
    }

    /// Drop the current connection so the next command reconnects.
    async fn disconnect(&self) {
        let mut slot = self.conn.write().await;
        if slot.take().is_some() && self.healthy.swap(false, Ordering::SeqCst) {
            warn!(url = %self.config.url, "Lost Redis connection");
        }
    }

    /// Run a command with the configured timeout and bounded retries.
    ///
    /// Connectivity failures and timeouts are retried on a fresh connection.
    /// Command errors (wrong type, script errors) are returned immediately.
    async fn run<T, F, Fut>(&self, command: &'static str, op: F) -> RemoteResult<T>
    where
        F: Fn(MultiplexedConnection) -> Fut + Send + Sync,
        Fut: Future<Output = RedisResult<T>> + Send,
        T: Send,
    {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = TransportError::Unavailable {
            reason: "no attempt made".to_string(),
        };

        for attempt in 1..=attempts {
            let conn = match self.connection().await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(command, attempt, error = %e, "Redis connect failed");
                    last_error = e;
                    continue;
                }
            };

            match tokio::time::timeout(self.config.operation_timeout, op(conn)).await {
                Ok(Ok(value)) => {
                    self.healthy.store(true, Ordering::SeqCst);
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    let err = classify(command, &e);
                    if !err.is_connectivity() {
                        return Err(err);
                    }
                    debug!(command, attempt, error = %e, "Redis command failed");
                    self.disconnect().await;
                    last_error = err;
                }
                Err(_) => {
                    debug!(command, attempt, "Redis command timed out");
                    self.disconnect().await;
                    last_error = TransportError::Timeout {
                        command: command.to_string(),
                        after: self.config.operation_timeout,
                    };
                }
            }
        }

        Err(last_error)
    }
}

/// Map a Redis error onto the transport taxonomy.
fn classify(command: &str, e: &RedisError) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout {
            command: command.to_string(),
            after: Duration::ZERO,
        }
    } else if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        TransportError::Unavailable {
            reason: e.to_string(),
        }
    } else {
        TransportError::Command {
            command: command.to_string(),
            reason: e.to_string(),
        }
    }
}

/// PX argument for `ttl`, at least one millisecond and at most a year.
fn millis(ttl: Duration) -> u64 {
    let capped = ttl.min(Duration::from_secs(MAX_TTL_SECS));
    u64::try_from(capped.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl RemoteStore for RedisRemoteStore {
    async fn get(&self, key: &str) -> RemoteResult<Option<Vec<u8>>> {
        self.run("GET", |mut conn| async move {
            let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> RemoteResult<()> {
        let value = value.as_slice();
        let ttl_ms = millis(ttl);
        self.run("SET", |mut conn| async move {
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, keys: &[String]) -> RemoteResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.run("DEL", |mut conn| async move {
            let removed: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
            Ok(removed)
        })
        .await
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> RemoteResult<(u64, Vec<String>)> {
        self.run("SCAN", |mut conn| async move {
            let page: (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count)
                .query_async(&mut conn)
                .await?;
            Ok(page)
        })
        .await
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> RemoteResult<i64> {
        let script = &self.incr_script;
        let ttl_ms = millis(ttl);
        self.run("EVALSHA", |mut conn| async move {
            let value: i64 = script
                .key(key)
                .arg(delta)
                .arg(ttl_ms)
                .invoke_async(&mut conn)
                .await?;
            Ok(value)
        })
        .await
    }

    async fn mget(&self, keys: &[String]) -> RemoteResult<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.run("MGET", |mut conn| async move {
            let values: Vec<Option<Vec<u8>>> =
                redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
            Ok(values)
        })
        .await
    }

    async fn mset(&self, entries: Vec<(String, Vec<u8>)>, ttl: Duration) -> RemoteResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let ttl_ms = millis(ttl);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in &entries {
            pipe.cmd("SET")
                .arg(key)
                .arg(value.as_slice())
                .arg("PX")
                .arg(ttl_ms)
                .ignore();
        }
        let pipe = &pipe;
        self.run("MSET", |mut conn| async move {
            let _: () = pipe.query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> RemoteResult<bool> {
        let ttl_ms = millis(ttl);
        self.run("SET NX", |mut conn| async move {
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await?;
            Ok(reply.is_some())
        })
        .await
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> RemoteResult<bool> {
        let script = &self.release_script;
        self.run("EVALSHA", |mut conn| async move {
            let removed: i64 = script.key(key).arg(token).invoke_async(&mut conn).await?;
            Ok(removed == 1)
        })
        .await
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for RedisRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRemoteStore")
            .field("url", &self.config.url)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chama_core::ChamaError;

    fn unreachable_config() -> RemoteConfig {
        RemoteConfig {
            // Port 1 is reserved; connections are refused immediately.
            url: "redis://127.0.0.1:1".to_string(),
            connect_timeout: Duration::from_millis(200),
            operation_timeout: Duration::from_millis(200),
            max_attempts: 2,
        }
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let config = RemoteConfig {
            url: "not a url".to_string(),
            ..RemoteConfig::default()
        };
        let err = RedisRemoteStore::new(config).unwrap_err();
        assert!(matches!(err, ChamaError::Config(_)));
    }

    #[test]
    fn test_new_store_is_unhealthy_until_connected() {
        let store = RedisRemoteStore::new(RemoteConfig::default()).unwrap();
        assert!(!store.is_healthy());
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_server_degrades() {
        let store = RedisRemoteStore::connect(unreachable_config())
            .await
            .expect("unreachable server must not fail construction");
        assert!(!store.is_healthy());

        let err = store.get("v1:k").await.unwrap_err();
        assert!(err.is_connectivity());
        assert!(!store.is_healthy());
    }

    #[test]
    fn test_classify_command_error() {
        let e = RedisError::from((redis::ErrorKind::TypeError, "WRONGTYPE"));
        let err = classify("INCRBY", &e);
        assert!(matches!(err, TransportError::Command { ref command, .. } if command == "INCRBY"));
        assert!(!err.is_connectivity());
    }

    #[test]
    fn test_classify_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = classify("GET", &RedisError::from(io));
        assert!(err.is_connectivity());
    }

    #[test]
    fn test_millis_never_zero() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn test_millis_caps_at_one_year() {
        assert_eq!(millis(Duration::MAX), MAX_TTL_SECS * 1000);
    }
}
