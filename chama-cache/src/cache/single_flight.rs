//! In-process request coalescing.
//!
//! At most one computation per key is in flight in a process. The first
//! caller for a key becomes the leader and starts the computation on its own
//! task; every later caller awaits the same shared result. The registry entry
//! is removed by a guard owned by the computation, so it disappears when the
//! computation finishes, fails or panics, and never because a waiter was
//! cancelled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chama_core::ChamaError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};

/// Serialized result shared by every waiter of one computation.
pub type FlightResult = Result<Arc<Vec<u8>>, ChamaError>;

/// Handle to an in-flight computation.
pub type SharedFlight = Shared<BoxFuture<'static, FlightResult>>;

/// Whether the caller started the computation or joined an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    Leader,
    Follower,
}

/// Registry of in-flight computations keyed by versioned key.
#[derive(Default)]
pub struct PendingFetches {
    pending: DashMap<String, (u64, SharedFlight)>,
    next_id: AtomicU64,
}

impl PendingFetches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the computation in flight for `key`, or start one with `start`.
    ///
    /// The check and the insert happen under one shard lock, so two callers
    /// can never both become leader for the same key. `start` receives the
    /// guard that must live for as long as the computation runs.
    pub fn join_or_start<F>(self: &Arc<Self>, key: &str, start: F) -> (SharedFlight, FlightRole)
    where
        F: FnOnce(FlightGuard) -> BoxFuture<'static, FlightResult>,
    {
        match self.pending.entry(key.to_string()) {
            Entry::Occupied(existing) => (existing.get().1.clone(), FlightRole::Follower),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let guard = FlightGuard {
                    registry: Arc::clone(self),
                    key: key.to_string(),
                    id,
                };
                let task = tokio::spawn(start(guard));
                let shared = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(join_error) => Err(ChamaError::fetch(join_error)),
                    }
                }
                .boxed()
                .shared();
                slot.insert((id, shared.clone()));
                (shared, FlightRole::Leader)
            }
        }
    }

    /// Whether a computation is in flight for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Number of computations in flight.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Removes a registry entry when dropped, but only the entry it created.
pub struct FlightGuard {
    registry: Arc<PendingFetches>,
    key: String,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let id = self.id;
        self.registry
            .pending
            .remove_if(&self.key, |_, (entry_id, _)| *entry_id == id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn bytes(s: &str) -> FlightResult {
        Ok(Arc::new(s.as_bytes().to_vec()))
    }

    fn explode() -> FlightResult {
        panic!("fetch exploded")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_computation() {
        let registry = Arc::new(PendingFetches::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = Arc::clone(&registry);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                let (flight, _) = registry.join_or_start("v1:k", |guard| {
                    async move {
                        let _guard = guard;
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        bytes("42")
                    }
                    .boxed()
                });
                flight.await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.as_slice(), b"42");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_entry_removed_after_error() {
        let registry = Arc::new(PendingFetches::new());
        let (flight, role) = registry.join_or_start("k", |guard| {
            async move {
                let _guard = guard;
                Err(ChamaError::Telemetry {
                    reason: "boom".to_string(),
                })
            }
            .boxed()
        });
        assert_eq!(role, FlightRole::Leader);
        assert!(flight.await.is_err());
        assert!(!registry.contains("k"));
    }

    #[tokio::test]
    async fn test_panic_becomes_fetch_error_and_cleans_up() {
        let registry = Arc::new(PendingFetches::new());
        let (flight, _) = registry.join_or_start("k", |guard| {
            async move {
                let _guard = guard;
                explode()
            }
            .boxed()
        });
        let err = flight.await.unwrap_err();
        assert!(err.is_fetch());
        assert!(!registry.contains("k"));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_abort_computation() {
        let registry = Arc::new(PendingFetches::new());
        let (flight, _) = registry.join_or_start("k", |guard| {
            async move {
                let _guard = guard;
                tokio::time::sleep(Duration::from_millis(20)).await;
                bytes("done")
            }
            .boxed()
        });
        // The only waiter gives up immediately.
        drop(flight);

        let (joined, role) = registry.join_or_start("k", |_| async { bytes("second") }.boxed());
        assert_eq!(role, FlightRole::Follower);
        assert_eq!(joined.await.unwrap().as_slice(), b"done");
    }

    #[tokio::test]
    async fn test_new_flight_after_completion() {
        let registry = Arc::new(PendingFetches::new());
        let (first, _) = registry.join_or_start("k", |g| {
            async move {
                let _g = g;
                bytes("a")
            }
            .boxed()
        });
        first.await.unwrap();

        let (second, role) = registry.join_or_start("k", |g| {
            async move {
                let _g = g;
                bytes("b")
            }
            .boxed()
        });
        assert_eq!(role, FlightRole::Leader);
        assert_eq!(second.await.unwrap().as_slice(), b"b");
    }
}
