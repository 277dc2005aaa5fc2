//! Advisory distributed lock over the remote store.
//!
//! A lock is a remote key `lock:{version}:{logical}` holding a random token,
//! set only if absent and bounded by a TTL. Only a [`HeldLock`] can release,
//! and releasing is a token-verified compare-and-delete, so a holder whose
//! lock expired and was re-acquired elsewhere cannot delete the new owner's
//! lock.
//!
//! ```text
//! try_acquire() ──→ Acquired(HeldLock) ─── release() ──→ (released)
//!        │
//!        ├────────→ Contended
//!        └────────→ Unavailable
//! ```

use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use super::traits::{RemoteResult, RemoteStore};

/// Outcome of a lock attempt. Contention and transport failure are both
/// ordinary outcomes, never errors.
#[derive(Debug)]
pub enum LockAttempt {
    /// This caller holds the lock.
    Acquired(HeldLock),
    /// Another holder has it.
    Contended,
    /// The remote tier could not be asked.
    Unavailable,
}

impl LockAttempt {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// A lock this process acquired. Consumed by [`release`](HeldLock::release).
#[derive(Debug)]
#[must_use = "an acquired lock should be released"]
pub struct HeldLock {
    key: String,
    token: String,
}

impl HeldLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Release the lock if this holder still owns it.
    ///
    /// `Ok(false)` means the lock had already expired or passed to another
    /// holder.
    pub async fn release<R: RemoteStore + ?Sized>(self, remote: &R) -> RemoteResult<bool> {
        let released = remote.compare_and_delete(&self.key, &self.token).await?;
        if !released {
            debug!(lock_key = %self.key, "Lock expired before release");
        }
        Ok(released)
    }
}

/// Try once to take the lock at `lock_key` for `ttl`.
pub async fn try_acquire<R: RemoteStore + ?Sized>(
    remote: &R,
    lock_key: String,
    ttl: Duration,
) -> LockAttempt {
    let token = Uuid::new_v4().to_string();
    match remote.set_if_absent(&lock_key, &token, ttl).await {
        Ok(true) => LockAttempt::Acquired(HeldLock {
            key: lock_key,
            token,
        }),
        Ok(false) => {
            debug!(lock_key = %lock_key, "Lock held elsewhere");
            LockAttempt::Contended
        }
        Err(e) => {
            debug!(lock_key = %lock_key, error = %e, "Lock attempt failed");
            LockAttempt::Unavailable
        }
    }
}
