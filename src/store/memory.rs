//! In-memory implementation of [`ConditionalStore`] for testing.
//!
//! Stores records in a HashMap behind a single async mutex, so every
//! operation is atomic the way a real backend's single-record writes
//! are. Versions come from a store-wide revision counter and TTLs are
//! enforced lazily: an expired record is indistinguishable from an
//! absent one at every read path.
//!
//! Fault injection (`fail_next`) and expiry acceleration (`expire`)
//! exist so retry and lease-expiry paths are testable without real
//! backend pressure or wall-clock waits.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ConditionalStore, Document, StoreError, Version};
use crate::types::now_unix_ms;

#[derive(Debug, Clone)]
struct Entry {
    body: String,
    version: u64,
    /// Unix-ms deadline after which the record no longer exists.
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at_ms, Some(deadline) if now_unix_ms() > deadline)
    }
}

#[derive(Default)]
struct Inner {
    map: HashMap<String, Entry>,
    /// Store-wide revision counter; every write gets a fresh version.
    revision: u64,
}

impl Inner {
    fn next_version(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Drop the entry if its TTL elapsed, then return the live entry.
    fn live(&mut self, key: &str) -> Option<&Entry> {
        if self.map.get(key).is_some_and(Entry::is_expired) {
            self.map.remove(key);
        }
        self.map.get(key)
    }
}

/// Deterministic, non-persistent [`ConditionalStore`].
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    faults: Mutex<VecDeque<StoreError>>,
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue an error to be returned by the next store operation.
    ///
    /// Queued errors are consumed in FIFO order, one per operation,
    /// before the operation touches any state.
    pub async fn fail_next(&self, error: StoreError) {
        self.faults.lock().await.push_back(error);
    }

    /// Force the record at `key` to be expired, as if its TTL elapsed.
    pub async fn expire(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.map.get_mut(key) {
            entry.expires_at_ms = Some(0);
        }
    }

    /// Number of live records, for test assertions.
    pub async fn len(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.map.retain(|_, entry| !entry.is_expired());
        inner.map.len()
    }

    /// True when the store holds no live records.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn take_fault(&self) -> Option<StoreError> {
        self.faults.lock().await.pop_front()
    }
}

#[async_trait]
impl ConditionalStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Document, StoreError> {
        if let Some(fault) = self.take_fault().await {
            return Err(fault);
        }
        let mut inner = self.inner.lock().await;
        match inner.live(key) {
            Some(entry) => Ok(Document {
                key: key.to_string(),
                body: entry.body.clone(),
                version: Version(entry.version),
            }),
            None => Err(StoreError::NotFound { key: key.to_string() }),
        }
    }

    async fn create(&self, key: &str, body: &str) -> Result<Version, StoreError> {
        if let Some(fault) = self.take_fault().await {
            return Err(fault);
        }
        let mut inner = self.inner.lock().await;
        if inner.live(key).is_some() {
            return Err(StoreError::AlreadyExists { key: key.to_string() });
        }
        let version = inner.next_version();
        inner.map.insert(
            key.to_string(),
            Entry {
                body: body.to_string(),
                version,
                expires_at_ms: None,
            },
        );
        Ok(Version(version))
    }

    async fn conditional_put(&self, key: &str, body: &str, expected: Version) -> Result<Version, StoreError> {
        if let Some(fault) = self.take_fault().await {
            return Err(fault);
        }
        let mut inner = self.inner.lock().await;
        let expires_at_ms = match inner.live(key) {
            None => return Err(StoreError::NotFound { key: key.to_string() }),
            Some(entry) if entry.version != expected.0 => {
                return Err(StoreError::VersionConflict { key: key.to_string() });
            }
            Some(entry) => entry.expires_at_ms,
        };
        let version = inner.next_version();
        inner.map.insert(
            key.to_string(),
            Entry {
                body: body.to_string(),
                version,
                expires_at_ms,
            },
        );
        Ok(Version(version))
    }

    async fn conditional_increment(
        &self,
        key: &str,
        field: &str,
        amount: i64,
        expected: Version,
    ) -> Result<Version, StoreError> {
        if let Some(fault) = self.take_fault().await {
            return Err(fault);
        }
        let mut inner = self.inner.lock().await;
        let entry = match inner.live(key) {
            None => return Err(StoreError::NotFound { key: key.to_string() }),
            Some(entry) if entry.version != expected.0 => {
                return Err(StoreError::VersionConflict { key: key.to_string() });
            }
            Some(entry) => entry.clone(),
        };

        let mut value: serde_json::Value =
            serde_json::from_str(&entry.body).map_err(|e| StoreError::Backend {
                reason: format!("record at '{key}' is not valid JSON: {e}"),
            })?;
        let current = value
            .get(field)
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| StoreError::Backend {
                reason: format!("field '{field}' of '{key}' is not an integer"),
            })?;
        let updated = current.checked_add(amount).ok_or_else(|| StoreError::Backend {
            reason: format!("field '{field}' of '{key}' overflowed"),
        })?;
        value[field] = serde_json::Value::from(updated);
        let body = value.to_string();

        let version = inner.next_version();
        inner.map.insert(
            key.to_string(),
            Entry {
                body,
                version,
                expires_at_ms: entry.expires_at_ms,
            },
        );
        Ok(Version(version))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        if let Some(fault) = self.take_fault().await {
            return Err(fault);
        }
        let mut inner = self.inner.lock().await;
        let was_live = inner.live(key).is_some();
        inner.map.remove(key);
        Ok(was_live)
    }

    async fn query_by_field(&self, field: &str, value: &str) -> Result<Vec<Document>, StoreError> {
        if let Some(fault) = self.take_fault().await {
            return Err(fault);
        }
        let mut inner = self.inner.lock().await;
        inner.map.retain(|_, entry| !entry.is_expired());

        let mut matching: Vec<Document> = inner
            .map
            .iter()
            .filter(|(_, entry)| {
                serde_json::from_str::<serde_json::Value>(&entry.body)
                    .ok()
                    .and_then(|v| v.get(field).and_then(|f| f.as_str().map(String::from)))
                    .is_some_and(|f| f == value)
            })
            .map(|(key, entry)| Document {
                key: key.clone(),
                body: entry.body.clone(),
                version: Version(entry.version),
            })
            .collect();

        // Sort by key for consistent ordering
        matching.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(matching)
    }

    async fn put_with_ttl(&self, key: &str, body: &str, ttl_seconds: u64) -> Result<Version, StoreError> {
        if let Some(fault) = self.take_fault().await {
            return Err(fault);
        }
        let mut inner = self.inner.lock().await;
        let version = inner.next_version();
        inner.map.insert(
            key.to_string(),
            Entry {
                body: body.to_string(),
                version,
                expires_at_ms: Some(now_unix_ms() + ttl_seconds * 1000),
            },
        );
        Ok(Version(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_get() {
        let store = InMemoryStore::new();
        let version = store.create("k", r#"{"a":1}"#).await.unwrap();

        let doc = store.get("k").await.unwrap();
        assert_eq!(doc.body, r#"{"a":1}"#);
        assert_eq!(doc.version, version);
    }

    #[tokio::test]
    async fn test_create_twice_conflicts() {
        let store = InMemoryStore::new();
        store.create("k", "{}").await.unwrap();
        let result = store.create("k", "{}").await;
        assert!(matches!(result, Err(StoreError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_conditional_put_enforces_version() {
        let store = InMemoryStore::new();
        let v1 = store.create("k", r#"{"a":1}"#).await.unwrap();
        let v2 = store.conditional_put("k", r#"{"a":2}"#, v1).await.unwrap();

        // Stale version is rejected and the record is untouched.
        let result = store.conditional_put("k", r#"{"a":3}"#, v1).await;
        assert!(matches!(result, Err(StoreError::VersionConflict { .. })));
        let doc = store.get("k").await.unwrap();
        assert_eq!(doc.body, r#"{"a":2}"#);
        assert_eq!(doc.version, v2);
    }

    #[tokio::test]
    async fn test_conditional_put_missing_key() {
        let store = InMemoryStore::new();
        let result = store.conditional_put("gone", "{}", Version(1)).await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_conditional_increment() {
        let store = InMemoryStore::new();
        let v1 = store.create("k", r#"{"count":10,"name":"x"}"#).await.unwrap();

        let v2 = store.conditional_increment("k", "count", -3, v1).await.unwrap();
        let doc = store.get("k").await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&doc.body).unwrap();
        assert_eq!(parsed["count"], 7);
        assert_eq!(parsed["name"], "x");

        let result = store.conditional_increment("k", "count", 1, v1).await;
        assert!(matches!(result, Err(StoreError::VersionConflict { .. })));
        let _ = v2;
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryStore::new();
        store.create("k", "{}").await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry_reads_as_absent() {
        let store = InMemoryStore::new();
        store.put_with_ttl("k", "{}", 60).await.unwrap();
        assert!(store.get("k").await.is_ok());

        store.expire("k").await;
        let result = store.get("k").await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_put_with_ttl_rearms_expiry() {
        let store = InMemoryStore::new();
        store.put_with_ttl("k", "{}", 60).await.unwrap();
        store.expire("k").await;

        // A fresh write resurrects the record with a new deadline.
        store.put_with_ttl("k", "{}", 60).await.unwrap();
        assert!(store.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_query_by_field() {
        let store = InMemoryStore::new();
        store.create("a", r#"{"name":"sale","count":1}"#).await.unwrap();
        store.create("b", r#"{"name":"sale","count":2}"#).await.unwrap();
        store.create("c", r#"{"name":"other","count":3}"#).await.unwrap();

        let docs = store.query_by_field("name", "sale").await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].key, "a");
        assert_eq!(docs[1].key, "b");
    }

    #[tokio::test]
    async fn test_query_skips_expired() {
        let store = InMemoryStore::new();
        store.put_with_ttl("a", r#"{"name":"sale"}"#, 60).await.unwrap();
        store.expire("a").await;

        let docs = store.query_by_field("name", "sale").await.unwrap();
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn test_fault_injection_fifo() {
        let store = InMemoryStore::new();
        store.create("k", "{}").await.unwrap();
        store.fail_next(StoreError::Throttled { retry_after_ms: 5 }).await;
        store.fail_next(StoreError::Timeout { duration_ms: 10 }).await;

        assert!(matches!(store.get("k").await, Err(StoreError::Throttled { .. })));
        assert!(matches!(store.get("k").await, Err(StoreError::Timeout { .. })));
        assert!(store.get("k").await.is_ok());
    }
}
