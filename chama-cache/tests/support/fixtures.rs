#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chama_cache::{CacheManager, InMemoryRemoteStore};
use chama_core::{CacheConfig, CircuitBreakerConfig};
use serde::{Deserialize, Serialize};

pub type TestManager = CacheManager<InMemoryRemoteStore>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub members: u32,
    pub total_contributions: i64,
    pub active_loans: u32,
}

pub fn dashboard(members: u32) -> DashboardStats {
    DashboardStats {
        members,
        total_contributions: i64::from(members) * 1_500,
        active_loans: members / 3,
    }
}

pub fn config() -> CacheConfig {
    CacheConfig::default()
        .with_lock_timing(Duration::from_secs(5), Duration::from_millis(200))
        .with_circuit(CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(30),
        })
}

pub fn remote() -> Arc<InMemoryRemoteStore> {
    Arc::new(InMemoryRemoteStore::new())
}

/// A manager over `remote`, standing in for one backend process.
pub fn process(remote: &Arc<InMemoryRemoteStore>) -> TestManager {
    process_with(config(), remote)
}

pub fn process_with(config: CacheConfig, remote: &Arc<InMemoryRemoteStore>) -> TestManager {
    CacheManager::new(config, Arc::clone(remote)).expect("valid test config")
}

/// Counts invocations of a fetch closure.
#[derive(Clone, Default)]
pub struct FetchCounter(Arc<AtomicUsize>);

impl FetchCounter {
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn db_error(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::ConnectionRefused, msg.to_string())
}
