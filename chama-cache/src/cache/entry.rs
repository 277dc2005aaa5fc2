//! Wire format for values in the remote tier.
//!
//! `[stored_at millis: i64 LE][ttl millis: u64 LE][json value]`
//!
//! Carrying the write time lets any process compute staleness; carrying the
//! TTL lets a process that reads the entry give its local copy no more than
//! the remaining lifetime.

use std::time::Duration;

use chrono::{DateTime, Utc};

const HEADER_LEN: usize = 16;

/// A decoded remote entry borrowing its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry<'a> {
    pub stored_at: DateTime<Utc>,
    pub ttl: Duration,
    pub payload: &'a [u8],
}

impl<'a> RemoteEntry<'a> {
    /// Decode a frame. Returns `None` for frames too short to carry a header
    /// or with an unrepresentable timestamp.
    pub fn decode(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let stored_at_ms = i64::from_le_bytes(bytes[0..8].try_into().ok()?);
        let ttl_ms = u64::from_le_bytes(bytes[8..16].try_into().ok()?);
        Some(Self {
            stored_at: DateTime::from_timestamp_millis(stored_at_ms)?,
            ttl: Duration::from_millis(ttl_ms),
            payload: &bytes[HEADER_LEN..],
        })
    }

    /// Lifetime left as of now. Zero once expired.
    pub fn remaining_ttl(&self) -> Duration {
        let age = Utc::now()
            .signed_duration_since(self.stored_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.ttl.saturating_sub(age)
    }
}

/// Encode a frame.
pub fn encode(stored_at: DateTime<Utc>, ttl: Duration, payload: &[u8]) -> Vec<u8> {
    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&stored_at.timestamp_millis().to_le_bytes());
    out.extend_from_slice(&ttl_ms.to_le_bytes());
    out.extend_from_slice(payload);
    out
}
