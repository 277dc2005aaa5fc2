//! Circuit breaker guarding the remote tier.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::RwLock;

use chama_core::{CircuitBreakerConfig, CircuitState};
use tokio::time::Instant;
use tracing::{info, warn};

/// Tracks consecutive remote failures and short-circuits calls while the
/// remote tier is considered down.
///
/// Closed opens after `failure_threshold` consecutive failures. Open becomes
/// half-open once `reset_timeout` has passed since it opened. Half-open closes
/// after `success_threshold` successes and reopens on any failure.
pub struct CircuitBreaker {
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            config,
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::SeqCst))
    }

    /// Whether remote calls must be skipped right now.
    ///
    /// An open circuit whose reset timeout has elapsed moves to half-open
    /// and lets the call through as a trial request.
    pub fn is_open(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let elapsed = match self.opened_at.read() {
                    Ok(guard) => guard.map(|at| at.elapsed() >= self.config.reset_timeout),
                    Err(_) => None,
                };
                if elapsed != Some(true) {
                    return true;
                }
                if self
                    .state
                    .compare_exchange(
                        CircuitState::Open as u8,
                        CircuitState::HalfOpen as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    self.success_count.store(0, Ordering::SeqCst);
                    info!(state = %CircuitState::HalfOpen, "Remote circuit probing");
                }
                false
            }
        }
    }

    /// Record a successful remote call.
    pub fn on_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);

        if self.state() == CircuitState::HalfOpen {
            let count = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
            if count >= self.config.success_threshold
                && self
                    .state
                    .compare_exchange(
                        CircuitState::HalfOpen as u8,
                        CircuitState::Closed as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
            {
                self.success_count.store(0, Ordering::SeqCst);
                info!(state = %CircuitState::Closed, "Remote circuit closed");
            }
        }
    }

    /// Record a failed remote call.
    pub fn on_failure(&self) {
        self.success_count.store(0, Ordering::SeqCst);
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;

        let should_open = match self.state() {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => count >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open {
            self.open(count);
        }
    }

    fn open(&self, failures: u32) {
        if let Ok(mut guard) = self.opened_at.write() {
            *guard = Some(Instant::now());
        }
        let previous = CircuitState::from(
            self.state
                .swap(CircuitState::Open as u8, Ordering::SeqCst),
        );
        if previous != CircuitState::Open {
            warn!(
                failures,
                reset_timeout = ?self.config.reset_timeout,
                from = %previous,
                "Remote circuit opened, serving from local tier only"
            );
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("failure_count", &self.failure_count.load(Ordering::Relaxed))
            .field("success_count", &self.success_count.load(Ordering::Relaxed))
            .finish()
    }
}
