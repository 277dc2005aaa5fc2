//! In-memory remote store.
//!
//! Implements the full [`RemoteStore`] contract inside the process: expiries,
//! cursor scans over native patterns, atomic counters and token-guarded
//! deletes. Used by tests and local development in place of Redis. Outages
//! can be simulated with [`InMemoryRemoteStore::set_available`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chama_core::TransportError;
use tokio::time::Instant;

use super::glob::compile_native;
use super::traits::{RemoteResult, RemoteStore};

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Option<Instant>,
    /// Insertion order, used as the scan cursor. Kept across overwrites.
    seq: u64,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, StoredValue>,
    next_seq: u64,
}

impl Keyspace {
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut StoredValue> {
        let expired = !self.entries.get(key)?.is_live(now);
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    fn put(&mut self, key: &str, value: Vec<u8>, expires_at: Option<Instant>) {
        let now = Instant::now();
        let existing = self.live(key, now).map(|v| v.seq);
        let seq = match existing {
            Some(seq) => seq,
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at,
                seq,
            },
        );
    }
}

/// Remote store held entirely in process memory.
#[derive(Debug)]
pub struct InMemoryRemoteStore {
    keyspace: Mutex<Keyspace>,
    available: AtomicBool,
    calls: AtomicU64,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            available: AtomicBool::new(true),
            calls: AtomicU64::new(0),
        }
    }

    /// Simulate the store going down (`false`) or recovering (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of commands received, failed ones included.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether a live entry exists, without counting as a call.
    pub fn contains(&self, key: &str) -> bool {
        self.keyspace
            .lock()
            .map(|mut ks| ks.live(key, Instant::now()).is_some())
            .unwrap_or(false)
    }

    /// All live keys, sorted, without counting as a call.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .keyspace
            .lock()
            .map(|ks| {
                ks.entries
                    .iter()
                    .filter(|(_, v)| v.is_live(now))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    fn enter(&self, command: &str) -> RemoteResult<MutexGuard<'_, Keyspace>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable {
                reason: format!("{command}: simulated outage"),
            });
        }
        self.keyspace.lock().map_err(|_| TransportError::Command {
            command: command.to_string(),
            reason: "keyspace lock poisoned".to_string(),
        })
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn get(&self, key: &str) -> RemoteResult<Option<Vec<u8>>> {
        let mut ks = self.enter("GET")?;
        Ok(ks.live(key, Instant::now()).map(|v| v.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> RemoteResult<()> {
        let mut ks = self.enter("SET")?;
        ks.put(key, value, Instant::now().checked_add(ttl));
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> RemoteResult<u64> {
        let mut ks = self.enter("DEL")?;
        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            if let Some(v) = ks.entries.remove(key) {
                if v.is_live(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> RemoteResult<(u64, Vec<String>)> {
        let matcher = compile_native(pattern).map_err(|e| TransportError::Command {
            command: "SCAN".to_string(),
            reason: e.to_string(),
        })?;
        let ks = self.enter("SCAN")?;
        let now = Instant::now();

        let mut page: Vec<(u64, &String, bool)> = ks
            .entries
            .iter()
            .filter(|(_, v)| v.seq > cursor)
            .map(|(k, v)| (v.seq, k, v.is_live(now)))
            .collect();
        page.sort_unstable_by_key(|(seq, _, _)| *seq);

        let count = count.max(1);
        let exhausted = page.len() <= count;
        page.truncate(count);

        let next = match (exhausted, page.last()) {
            (false, Some((seq, _, _))) => *seq,
            _ => 0,
        };
        let keys = page
            .into_iter()
            .filter(|(_, key, live)| *live && matcher.is_match(key))
            .map(|(_, key, _)| key.clone())
            .collect();
        Ok((next, keys))
    }

    async fn incr_by(&self, key: &str, delta: i64, ttl: Duration) -> RemoteResult<i64> {
        let mut ks = self.enter("INCRBY")?;
        let now = Instant::now();
        let (current, expires_at) = match ks.live(key, now) {
            Some(v) => {
                let parsed = std::str::from_utf8(&v.value)
                    .ok()
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or_else(|| TransportError::Command {
                        command: "INCRBY".to_string(),
                        reason: "value is not an integer".to_string(),
                    })?;
                (parsed, v.expires_at)
            }
            None => (0, now.checked_add(ttl)),
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| TransportError::Command {
                command: "INCRBY".to_string(),
                reason: "increment would overflow".to_string(),
            })?;
        ks.put(key, next.to_string().into_bytes(), expires_at);
        Ok(next)
    }

    async fn mget(&self, keys: &[String]) -> RemoteResult<Vec<Option<Vec<u8>>>> {
        let mut ks = self.enter("MGET")?;
        let now = Instant::now();
        Ok(keys
            .iter()
            .map(|key| ks.live(key, now).map(|v| v.value.clone()))
            .collect())
    }

    async fn mset(&self, entries: Vec<(String, Vec<u8>)>, ttl: Duration) -> RemoteResult<()> {
        let mut ks = self.enter("MSET")?;
        let expires_at = Instant::now().checked_add(ttl);
        for (key, value) in entries {
            ks.put(&key, value, expires_at);
        }
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> RemoteResult<bool> {
        let mut ks = self.enter("SET NX")?;
        if ks.live(key, Instant::now()).is_some() {
            return Ok(false);
        }
        ks.put(key, token.as_bytes().to_vec(), Instant::now().checked_add(ttl));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> RemoteResult<bool> {
        let mut ks = self.enter("EVAL")?;
        let holds_token = ks
            .live(key, Instant::now())
            .is_some_and(|v| v.value == token.as_bytes());
        if holds_token {
            ks.entries.remove(key);
        }
        Ok(holds_token)
    }

    fn is_healthy(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}
