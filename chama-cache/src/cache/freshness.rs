//! Freshness contracts for cache reads.
//!
//! A caller either trusts the entry TTL or narrows it with a per-call
//! staleness window. Reads through [`get_with`](super::CacheManager::get_with)
//! return a [`CacheRead<T>`] carrying the serving tier and entry age.

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Freshness requirement for cache reads.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Freshness {
    /// Any unexpired entry is acceptable.
    #[default]
    Ttl,

    /// Accept an entry only if it was stored no more than `max_staleness` ago.
    ///
    /// Older entries are treated as a miss in that tier. They are not
    /// deleted; a caller with a wider window may still see them.
    BestEffort {
        /// Maximum acceptable age of the entry.
        max_staleness: Duration,
    },
}

impl Freshness {
    /// Create a BestEffort freshness with the given max staleness.
    pub fn best_effort(max_staleness: Duration) -> Self {
        Self::BestEffort { max_staleness }
    }

    /// Returns true if this is a BestEffort freshness.
    pub fn is_best_effort(&self) -> bool {
        matches!(self, Self::BestEffort { .. })
    }

    /// Whether an entry stored at `stored_at` satisfies this requirement.
    pub fn accepts(&self, stored_at: DateTime<Utc>) -> bool {
        match self {
            Self::Ttl => true,
            Self::BestEffort { max_staleness } => age_of(stored_at) <= *max_staleness,
        }
    }
}

/// Which tier served a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTier {
    /// In-process tier
    Local,
    /// Shared networked tier
    Remote,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a cache read, carrying staleness metadata.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    stored_at: DateTime<Utc>,
    tier: CacheTier,
}

impl<T> CacheRead<T> {
    pub fn new(value: T, stored_at: DateTime<Utc>, tier: CacheTier) -> Self {
        Self {
            value,
            stored_at,
            tier,
        }
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// When the entry was written by whichever process populated it.
    pub fn stored_at(&self) -> DateTime<Utc> {
        self.stored_at
    }

    pub fn tier(&self) -> CacheTier {
        self.tier
    }

    /// Time since the entry was stored. Zero if the writer's clock is ahead.
    pub fn staleness(&self) -> Duration {
        age_of(self.stored_at)
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            stored_at: self.stored_at,
            tier: self.tier,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}

fn age_of(stored_at: DateTime<Utc>) -> Duration {
    Utc::now()
        .signed_duration_since(stored_at)
        .to_std()
        .unwrap_or(Duration::ZERO)
}
