//! Lease management: ephemeral liveness records with a TTL.
//!
//! A lease is the only evidence that a lock owner is alive. Owners
//! refresh their lease on every acquisition or renewal; the store
//! deletes the record once the TTL elapses without another write, and
//! that disappearance is what lets the next caller take the lock over.

use std::sync::Arc;

use tracing::debug;

use crate::error::{CoordinationError, CorruptedDataSnafu};
use crate::store::{lease_key, ConditionalStore, StoreError};
use crate::types::LeaseRecord;

/// Creates, renews and deletes liveness leases.
pub struct LeaseManager<S: ConditionalStore + ?Sized> {
    store: Arc<S>,
}

impl<S: ConditionalStore + ?Sized> Clone for LeaseManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: ConditionalStore + ?Sized> LeaseManager<S> {
    /// Create a lease manager over the given store handle.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Upsert the lease for `owner_id`, restarting its expiry clock.
    ///
    /// Renewal is a blind upsert: an existing record is not an error,
    /// it just gets a fresh TTL.
    pub async fn create_or_renew(
        &self,
        owner_id: &str,
        duration_seconds: u64,
    ) -> Result<(), CoordinationError> {
        let record = LeaseRecord::new(owner_id, duration_seconds);
        let body = serde_json::to_string(&record)?;
        self.store
            .put_with_ttl(&lease_key(owner_id), &body, duration_seconds)
            .await?;
        debug!(owner = %owner_id, ttl_seconds = duration_seconds, "lease upserted");
        Ok(())
    }

    /// True iff an unexpired lease exists for `owner_id`.
    ///
    /// `NotFound` is the expected signal of expiry, not an error.
    pub async fn is_valid(&self, owner_id: &str) -> Result<bool, CoordinationError> {
        match self.store.get(&lease_key(owner_id)).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the lease for `owner_id`. Releasing a lease that does
    /// not exist is harmless.
    pub async fn release(&self, owner_id: &str) -> Result<(), CoordinationError> {
        let deleted = self.store.delete(&lease_key(owner_id)).await?;
        debug!(owner = %owner_id, deleted, "lease released");
        Ok(())
    }

    /// All live leases, for inspection.
    pub async fn list(&self) -> Result<Vec<LeaseRecord>, CoordinationError> {
        let docs = self
            .store
            .query_by_field("entity_type", LeaseRecord::ENTITY)
            .await?;
        docs.into_iter()
            .map(|doc| {
                serde_json::from_str(&doc.body).map_err(|e| {
                    CorruptedDataSnafu {
                        key: doc.key.clone(),
                        reason: e.to_string(),
                    }
                    .build()
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn test_lease_valid_until_expiry() {
        let store = InMemoryStore::new();
        let leases = LeaseManager::new(store.clone());

        leases.create_or_renew("worker-1", 30).await.unwrap();
        assert!(leases.is_valid("worker-1").await.unwrap());

        store.expire(&lease_key("worker-1")).await;
        assert!(!leases.is_valid("worker-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_resurrects_expired_lease() {
        let store = InMemoryStore::new();
        let leases = LeaseManager::new(store.clone());

        leases.create_or_renew("worker-1", 30).await.unwrap();
        store.expire(&lease_key("worker-1")).await;

        leases.create_or_renew("worker-1", 30).await.unwrap();
        assert!(leases.is_valid("worker-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_lease_is_not_valid() {
        let store = InMemoryStore::new();
        let leases = LeaseManager::new(store);
        assert!(!leases.is_valid("nobody").await.unwrap());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = InMemoryStore::new();
        let leases = LeaseManager::new(store);

        leases.create_or_renew("worker-1", 30).await.unwrap();
        leases.release("worker-1").await.unwrap();
        leases.release("worker-1").await.unwrap();
        assert!(!leases.is_valid("worker-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_live_leases() {
        let store = InMemoryStore::new();
        let leases = LeaseManager::new(store.clone());

        leases.create_or_renew("worker-1", 30).await.unwrap();
        leases.create_or_renew("worker-2", 30).await.unwrap();
        store.expire(&lease_key("worker-2")).await;

        let live = leases.list().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].owner_id, "worker-1");
    }
}
