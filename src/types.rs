//! Shared record types for coordination primitives.

use serde::Deserialize;
use serde::Serialize;

/// Durable lock record, one per lock name.
///
/// Serialized as JSON for human readability and debugging.
/// The record is never deleted during normal operation; ownership
/// changes rewrite `owner_id` and bump `fence_token` in a single
/// conditional write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockRecord {
    /// Lock name, also the record's identity.
    pub name: String,
    /// Current holder. Empty string means unowned.
    pub owner_id: String,
    /// Monotonically non-decreasing token, bumped exactly once per
    /// successful ownership transfer.
    pub fence_token: u64,
    /// Record kind marker, used by field queries.
    pub entity_type: String,
}

impl LockRecord {
    /// Marker value stored in `entity_type`.
    pub const ENTITY: &'static str = "lock";

    /// Create a record for a first-time acquisition (fence token 1).
    pub fn first(name: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner_id: owner_id.into(),
            fence_token: 1,
            entity_type: Self::ENTITY.to_string(),
        }
    }

    /// The successor record for an ownership transfer to `new_owner`.
    pub fn transferred_to(&self, new_owner: impl Into<String>) -> Self {
        Self {
            name: self.name.clone(),
            owner_id: new_owner.into(),
            fence_token: self.fence_token + 1,
            entity_type: Self::ENTITY.to_string(),
        }
    }

    /// True when no owner is recorded.
    pub fn is_unowned(&self) -> bool {
        self.owner_id.is_empty()
    }
}

/// Liveness record, one per owner, expired by the store's TTL.
///
/// Existence of an unexpired lease is the only liveness signal the
/// lock protocol trusts. The record body carries the requested
/// duration for observability; expiry itself is the store's job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Owner this lease keeps alive.
    pub owner_id: String,
    /// Requested TTL in seconds.
    pub lease_duration_seconds: u64,
    /// Record kind marker, used by field queries.
    pub entity_type: String,
}

impl LeaseRecord {
    /// Marker value stored in `entity_type`.
    pub const ENTITY: &'static str = "lease";

    /// Create a lease record for `owner_id`.
    pub fn new(owner_id: impl Into<String>, lease_duration_seconds: u64) -> Self {
        Self {
            owner_id: owner_id.into(),
            lease_duration_seconds,
            entity_type: Self::ENTITY.to_string(),
        }
    }
}

/// One partition of a logical counter.
///
/// The logical value is the sum of `count` over all shards sharing a
/// `partition_id`. Bounds are duplicated on every shard so a reader
/// never needs a separate metadata record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterShard {
    /// Shard identity, `{name}_{index}`.
    pub id: String,
    /// Logical counter name; groups shards for aggregation.
    pub partition_id: String,
    /// Logical counter name (same as `partition_id`).
    pub name: String,
    /// This shard's contribution to the aggregate.
    pub count: i64,
    /// Lower bound for the logical counter.
    pub min: i64,
    /// Upper bound for the logical counter.
    pub max: i64,
    /// Record kind marker, used by field queries.
    pub entity_type: String,
}

impl CounterShard {
    /// Marker value stored in `entity_type`.
    pub const ENTITY: &'static str = "counter_shard";

    /// Create a shard record. Shard indexes start at 1.
    pub fn new(name: &str, index: u32, count: i64, min: i64, max: i64) -> Self {
        Self {
            id: format!("{name}_{index}"),
            partition_id: name.to_string(),
            name: name.to_string(),
            count,
            min,
            max,
            entity_type: Self::ENTITY.to_string(),
        }
    }
}

/// Fencing token returned on successful lock acquisition.
///
/// Include this token in all operations protected by the lock.
/// Downstream services should reject operations carrying a token
/// older than the newest one they have seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FencingToken(pub u64);

impl FencingToken {
    /// Create a new fencing token.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw token value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for FencingToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FencingToken({})", self.0)
    }
}

/// Get current Unix timestamp in milliseconds.
///
/// Returns 0 if system time is before UNIX epoch, which prevents
/// panics on misconfigured clocks.
#[inline]
pub fn now_unix_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
