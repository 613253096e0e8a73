//! Abstract conditional-write document store.
//!
//! The coordination primitives never talk to a concrete backend; they
//! are handed an [`ConditionalStore`] at construction and compose its
//! single-record conditional writes. The contract is deliberately
//! small: point reads, create-if-absent, version-guarded puts and
//! field increments, idempotent deletes, equality queries over record
//! fields, and TTL upserts whose records vanish without renewal.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub mod memory;
pub use memory::InMemoryStore;

/// Opaque concurrency-control tag attached to every stored record.
///
/// A conditional write must present the version last read for the
/// record; the store rejects the write if the record has moved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version(pub u64);

/// A stored record together with its current version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub key: String,
    /// JSON-serialized record body.
    pub body: String,
    pub version: Version,
}

/// Errors surfaced by a [`ConditionalStore`].
///
/// `NotFound`, `AlreadyExists` and `VersionConflict` are normal
/// protocol branches for the callers in this crate, not failures.
/// `Throttled` and `Timeout` are transient backend pressure. Anything
/// in `Backend` is fatal and propagated unmodified.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("key '{key}' not found")]
    NotFound { key: String },
    #[error("key '{key}' already exists")]
    AlreadyExists { key: String },
    #[error("version conflict on key '{key}'")]
    VersionConflict { key: String },
    #[error("request throttled, retry after {retry_after_ms}ms")]
    Throttled { retry_after_ms: u64 },
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("backend failure: {reason}")]
    Backend { reason: String },
}

impl StoreError {
    /// True for kinds a caller resolves by re-reading and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. } | StoreError::Throttled { .. } | StoreError::Timeout { .. }
        )
    }
}

/// Conditional-write, TTL-capable document store.
///
/// Implementations must make every write either atomic under the
/// presented version or idempotent (`put_with_ttl`, `delete`). This
/// is the only synchronization primitive the coordination layer uses.
#[async_trait]
pub trait ConditionalStore: Send + Sync {
    /// Point read. `NotFound` if the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Document, StoreError>;

    /// Create a record that must not exist yet.
    async fn create(&self, key: &str, body: &str) -> Result<Version, StoreError>;

    /// Replace a record, succeeding only if `expected` is still its
    /// current version. `NotFound` if the record vanished.
    async fn conditional_put(&self, key: &str, body: &str, expected: Version) -> Result<Version, StoreError>;

    /// Atomically add `amount` to the integer field `field`, succeeding
    /// only if `expected` is still the record's current version.
    async fn conditional_increment(
        &self,
        key: &str,
        field: &str,
        amount: i64,
        expected: Version,
    ) -> Result<Version, StoreError>;

    /// Delete a record. Returns false if the key was absent; deleting
    /// a missing record is not an error.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// All unexpired records whose string field `field` equals `value`.
    async fn query_by_field(&self, field: &str, value: &str) -> Result<Vec<Document>, StoreError>;

    /// Upsert a record and (re)arm automatic expiry `ttl_seconds` from
    /// now. Every write resets the expiry clock.
    async fn put_with_ttl(&self, key: &str, body: &str, ttl_seconds: u64) -> Result<Version, StoreError>;
}

/// Key for the durable lock record of `lock_name`.
pub fn lock_key(lock_name: &str) -> String {
    format!("lock/{lock_name}")
}

/// Key for the liveness lease of `owner_id`.
pub fn lease_key(owner_id: &str) -> String {
    format!("lease/{owner_id}")
}

/// Key for shard `index` of counter `name`. Shard indexes start at 1.
pub fn shard_key(name: &str, index: u32) -> String {
    format!("counter/{name}_{index}")
}
