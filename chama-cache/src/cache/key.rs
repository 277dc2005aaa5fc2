//! Versioned and chama-scoped cache keys.
//!
//! Every key that reaches either tier is a [`VersionedKey`]:
//! `{version}:{logical}`. Bumping the configured version orphans every prior
//! entry without deleting anything.
//!
//! Logical keys for tenant data are built with [`ChamaScopedKey`], whose
//! private inner struct makes it impossible to construct a key without a
//! chama (tenant) id.

use std::fmt;
use std::str::FromStr;

use chama_core::constants::LOCK_KEY_PREFIX;
use chama_core::ChamaId;
use uuid::Uuid;

/// Separator between key segments.
const SEPARATOR: char = ':';

/// Namespace segment for tenant-scoped keys.
const CHAMA_NAMESPACE: &str = "chama";

// ============================================================================
// VERSIONED KEY
// ============================================================================

/// A logical key bound to a cache version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionedKey {
    encoded: String,
    version_len: usize,
}

impl VersionedKey {
    /// Bind `logical` to `version`.
    pub fn new(version: &str, logical: &str) -> Self {
        let mut encoded = String::with_capacity(version.len() + 1 + logical.len());
        encoded.push_str(version);
        encoded.push(SEPARATOR);
        encoded.push_str(logical);
        Self {
            encoded,
            version_len: version.len(),
        }
    }

    /// The full `{version}:{logical}` form sent to storage.
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// The version segment.
    pub fn version(&self) -> &str {
        &self.encoded[..self.version_len]
    }

    /// The logical key the caller asked for.
    pub fn logical(&self) -> &str {
        &self.encoded[self.version_len + 1..]
    }

    /// Key of the advisory lock guarding this entry: `lock:{version}:{logical}`.
    pub fn lock_key(&self) -> String {
        format!("{}{}{}", LOCK_KEY_PREFIX, SEPARATOR, self.encoded)
    }

    /// Size of the encoded key in bytes.
    pub fn len(&self) -> usize {
        self.encoded.len()
    }

    /// Always false; a versioned key carries at least the separator.
    pub fn is_empty(&self) -> bool {
        self.encoded.is_empty()
    }
}

impl fmt::Display for VersionedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

impl AsRef<str> for VersionedKey {
    fn as_ref(&self) -> &str {
        &self.encoded
    }
}

// ============================================================================
// ENTRY KIND
// ============================================================================

/// The kinds of derived chama data that get cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Aggregated dashboard statistics
    DashboardStats,
    /// Member roster
    MemberList,
    /// Chama profile and settings
    ChamaDetails,
    /// Contribution totals per cycle
    ContributionSummary,
    /// Outstanding loans and schedules
    LoanPortfolio,
    /// Upcoming and past meetings
    MeetingSchedule,
    /// Welfare fund balance
    WelfareBalance,
}

impl EntryKind {
    /// All kinds, in a stable order.
    pub const ALL: [EntryKind; 7] = [
        EntryKind::DashboardStats,
        EntryKind::MemberList,
        EntryKind::ChamaDetails,
        EntryKind::ContributionSummary,
        EntryKind::LoanPortfolio,
        EntryKind::MeetingSchedule,
        EntryKind::WelfareBalance,
    ];

    /// Key segment for this kind. No segment is a prefix of another.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DashboardStats => "dashboard",
            Self::MemberList => "members",
            Self::ChamaDetails => "details",
            Self::ContributionSummary => "contributions",
            Self::LoanPortfolio => "loans",
            Self::MeetingSchedule => "meetings",
            Self::WelfareBalance => "welfare",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing an [`EntryKind`] from a key segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryKindParseError(pub String);

impl fmt::Display for EntryKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid entry kind: {}", self.0)
    }
}

impl std::error::Error for EntryKindParseError {}

impl FromStr for EntryKind {
    type Err = EntryKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| EntryKindParseError(s.to_string()))
    }
}

// ============================================================================
// CHAMA SCOPED KEY
// ============================================================================

/// A logical cache key scoped to one chama.
///
/// Encodes as `chama:{chama_id}:{kind}` or `chama:{chama_id}:{kind}:{sub_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChamaScopedKey {
    /// Private inner data - cannot be constructed externally
    inner: ScopedKeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ScopedKeyInner {
    chama_id: ChamaId,
    kind: EntryKind,
    sub_id: Option<String>,
}

impl ChamaScopedKey {
    /// Key for a chama-wide entry, e.g. the dashboard statistics.
    pub fn new(chama_id: ChamaId, kind: EntryKind) -> Self {
        Self {
            inner: ScopedKeyInner {
                chama_id,
                kind,
                sub_id: None,
            },
        }
    }

    /// Key for an entry narrowed below the chama, e.g. one member's loans.
    pub fn with_sub_id(chama_id: ChamaId, kind: EntryKind, sub_id: impl Into<String>) -> Self {
        Self {
            inner: ScopedKeyInner {
                chama_id,
                kind,
                sub_id: Some(sub_id.into()),
            },
        }
    }

    pub fn chama_id(&self) -> ChamaId {
        self.inner.chama_id
    }

    pub fn kind(&self) -> EntryKind {
        self.inner.kind
    }

    pub fn sub_id(&self) -> Option<&str> {
        self.inner.sub_id.as_deref()
    }

    /// Render the logical key.
    pub fn encode(&self) -> String {
        match &self.inner.sub_id {
            Some(sub) => format!(
                "{CHAMA_NAMESPACE}:{}:{}:{}",
                self.inner.chama_id, self.inner.kind, sub
            ),
            None => format!(
                "{CHAMA_NAMESPACE}:{}:{}",
                self.inner.chama_id, self.inner.kind
            ),
        }
    }

    /// Parse a logical key produced by [`encode`](Self::encode).
    ///
    /// Returns `None` for keys outside the chama namespace, a malformed chama
    /// id, an unknown kind, or an empty sub id.
    pub fn decode(key: &str) -> Option<Self> {
        let mut parts = key.splitn(4, SEPARATOR);
        if parts.next()? != CHAMA_NAMESPACE {
            return None;
        }
        let chama_id = Uuid::parse_str(parts.next()?).ok()?;
        let kind = parts.next()?.parse::<EntryKind>().ok()?;
        let sub_id = match parts.next() {
            Some("") => return None,
            Some(sub) => Some(sub.to_string()),
            None => None,
        };
        Some(Self {
            inner: ScopedKeyInner {
                chama_id,
                kind,
                sub_id,
            },
        })
    }

    /// Glob matching every cached entry of one chama.
    pub fn tenant_pattern(chama_id: ChamaId) -> String {
        format!("{CHAMA_NAMESPACE}:{chama_id}:*")
    }

    /// Glob matching every entry of one kind for one chama, with or without
    /// a sub id.
    pub fn kind_pattern(chama_id: ChamaId, kind: EntryKind) -> String {
        format!("{CHAMA_NAMESPACE}:{chama_id}:{kind}*")
    }
}

impl fmt::Display for ChamaScopedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}
