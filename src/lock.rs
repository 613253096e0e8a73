//! Distributed lock with fencing tokens.
//!
//! One durable record per lock name carries the current owner and a
//! monotonically increasing fence token. Liveness is a separate
//! TTL-bound lease per owner; an owner whose lease expired is treated
//! as dead and the next caller takes the lock over with a single
//! version-guarded write that swaps the owner and bumps the token.
//!
//! The token moves exactly once per successful ownership transfer, so
//! downstream services can reject writes from a stale former owner by
//! comparing tokens.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{CoordinationError, CorruptedDataSnafu};
use crate::lease::LeaseManager;
use crate::random::{RandomSource, ThreadRandom};
use crate::retry::{CancelFlag, RetryPolicy};
use crate::store::{lock_key, ConditionalStore, StoreError, Version};
use crate::types::{FencingToken, LockRecord};

/// Configuration for the lock service.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Delay before re-checking a lock that is held by a live owner.
    pub retry_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(250),
        }
    }
}

/// Outcome of a single pass over the acquisition state machine.
enum Attempt {
    /// Caller now holds the lock with this token.
    Acquired(FencingToken),
    /// Lock is held by a live owner; wait before re-reading.
    Held { holder: String },
    /// Lost a race (creation or transfer); re-read immediately-ish.
    Contended,
}

/// Fencing-token lock service.
///
/// Holds no in-process state per lock; every operation works against
/// the store, so any number of processes can share one lock name.
pub struct LockService<S: ConditionalStore + ?Sized> {
    store: Arc<S>,
    leases: LeaseManager<S>,
    config: LockConfig,
    retry: RetryPolicy,
    rand: Arc<dyn RandomSource>,
}

impl<S: ConditionalStore + ?Sized> LockService<S> {
    /// Create a lock service over the given store handle.
    pub fn new(store: Arc<S>, config: LockConfig, retry: RetryPolicy) -> Self {
        let leases = LeaseManager::new(store.clone());
        Self {
            store,
            leases,
            config,
            retry,
            rand: Arc::new(ThreadRandom),
        }
    }

    /// Replace the randomness used for retry jitter.
    pub fn with_random_source(mut self, rand: Arc<dyn RandomSource>) -> Self {
        self.rand = rand;
        self
    }

    /// The lease manager this service checks liveness against.
    pub fn leases(&self) -> &LeaseManager<S> {
        &self.leases
    }

    /// Acquire the lock named `lock_name` for `new_owner_id`.
    ///
    /// Returns the fence token of the resulting ownership. Repeated
    /// calls by the current holder renew the lease and return the
    /// existing token unchanged. The loop runs until the retry policy
    /// is exhausted or `cancel` is observed between attempts.
    pub async fn acquire(
        &self,
        lock_name: &str,
        new_owner_id: &str,
        lease_duration_seconds: u64,
        cancel: &CancelFlag,
    ) -> Result<FencingToken, CoordinationError> {
        let mut session = self.retry.session(format!("lock acquisition for '{lock_name}'"));

        loop {
            match self.try_acquire(lock_name, new_owner_id, lease_duration_seconds).await {
                Ok(Attempt::Acquired(token)) => return Ok(token),
                Ok(Attempt::Held { holder }) => {
                    debug!(lock = %lock_name, holder = %holder, "lock held, waiting");
                    session.pause_for(self.config.retry_interval, cancel).await?;
                }
                Ok(Attempt::Contended) => {
                    session.pause(self.rand.as_ref(), cancel).await?;
                }
                Err(e) if e.is_retryable_storage() => {
                    debug!(lock = %lock_name, error = %e, "transient store error, retrying");
                    session.pause(self.rand.as_ref(), cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One pass over the state machine: read, classify, write.
    async fn try_acquire(
        &self,
        lock_name: &str,
        new_owner_id: &str,
        lease_duration_seconds: u64,
    ) -> Result<Attempt, CoordinationError> {
        let key = lock_key(lock_name);

        match self.read_lock(&key).await? {
            // No lock record yet. Establish liveness first, then race
            // to create the record with the initial token.
            None => {
                self.leases.create_or_renew(new_owner_id, lease_duration_seconds).await?;
                let record = LockRecord::first(lock_name, new_owner_id);
                let body = serde_json::to_string(&record)?;
                match self.store.create(&key, &body).await {
                    Ok(_) => {
                        debug!(
                            lock = %lock_name,
                            owner = %new_owner_id,
                            fence_token = record.fence_token,
                            "lock created"
                        );
                        Ok(Attempt::Acquired(FencingToken(record.fence_token)))
                    }
                    Err(StoreError::AlreadyExists { .. }) => {
                        debug!(lock = %lock_name, "lost creation race");
                        Ok(Attempt::Contended)
                    }
                    Err(e) => Err(e.into()),
                }
            }

            // Re-acquisition by the current holder renews the lease
            // and never bumps the token.
            Some((current, _)) if current.owner_id == new_owner_id => {
                self.leases.create_or_renew(new_owner_id, lease_duration_seconds).await?;
                debug!(
                    lock = %lock_name,
                    owner = %new_owner_id,
                    fence_token = current.fence_token,
                    "lease renewed"
                );
                Ok(Attempt::Acquired(FencingToken(current.fence_token)))
            }

            // Owned by someone else, or recorded as unowned.
            Some((current, version)) => {
                if !current.is_unowned() && self.leases.is_valid(&current.owner_id).await? {
                    return Ok(Attempt::Held {
                        holder: current.owner_id,
                    });
                }

                // Previous owner is gone. Establish our own liveness,
                // then transfer ownership and bump the fence in one
                // version-guarded write.
                self.leases.create_or_renew(new_owner_id, lease_duration_seconds).await?;
                let next = current.transferred_to(new_owner_id);
                let body = serde_json::to_string(&next)?;
                match self.store.conditional_put(&key, &body, version).await {
                    Ok(_) => {
                        debug!(
                            lock = %lock_name,
                            owner = %new_owner_id,
                            previous_owner = %current.owner_id,
                            fence_token = next.fence_token,
                            "ownership transferred"
                        );
                        Ok(Attempt::Acquired(FencingToken(next.fence_token)))
                    }
                    Err(StoreError::VersionConflict { .. } | StoreError::NotFound { .. }) => {
                        debug!(lock = %lock_name, "transfer contended, re-reading");
                        Ok(Attempt::Contended)
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Check that `owner_id` still holds the lock under `token`.
    ///
    /// Returns true only on an exact match of both owner and token. A
    /// false result means exclusivity is gone and the caller must stop
    /// protected work immediately. Never retries internally.
    pub async fn validate(
        &self,
        lock_name: &str,
        owner_id: &str,
        token: FencingToken,
    ) -> Result<bool, CoordinationError> {
        match self.read_lock(&lock_key(lock_name)).await? {
            None => Ok(false),
            Some((record, _)) => {
                Ok(record.owner_id == owner_id && record.fence_token == token.value())
            }
        }
    }

    /// Voluntarily release the lock by deleting the owner's lease.
    ///
    /// The lock record itself is left untouched; the next acquirer
    /// observes the missing lease and transfers ownership through the
    /// normal conditional-update path. Releasing twice is harmless.
    pub async fn release(
        &self,
        lock_name: &str,
        owner_id: &str,
        token: FencingToken,
    ) -> Result<(), CoordinationError> {
        debug!(lock = %lock_name, owner = %owner_id, fence_token = token.value(), "releasing lock");
        self.leases.release(owner_id).await
    }

    /// All lock records, for inspection.
    pub async fn list(&self) -> Result<Vec<LockRecord>, CoordinationError> {
        let docs = self
            .store
            .query_by_field("entity_type", LockRecord::ENTITY)
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

    async fn read_lock(
        &self,
        key: &str,
    ) -> Result<Option<(LockRecord, Version)>, CoordinationError> {
        match self.store.get(key).await {
            Ok(doc) => {
                let record: LockRecord = serde_json::from_str(&doc.body).map_err(|e| {
                    CorruptedDataSnafu {
                        key: key.to_string(),
                        reason: e.to_string(),
                    }
                    .build()
                })?;
                Ok(Some((record, doc.version)))
            }
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{lease_key, InMemoryStore};

    fn quick_service(store: Arc<InMemoryStore>) -> LockService<InMemoryStore> {
        let config = LockConfig {
            retry_interval: Duration::from_millis(5),
        };
        let retry = RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..RetryPolicy::default()
        };
        LockService::new(store, config, retry)
    }

    #[tokio::test]
    async fn test_first_acquisition_gets_token_one() {
        let store = InMemoryStore::new();
        let locks = quick_service(store);
        let cancel = CancelFlag::new();

        let token = locks.acquire("jobs", "worker-1", 30, &cancel).await.unwrap();
        assert_eq!(token, FencingToken(1));
        assert!(locks.validate("jobs", "worker-1", token).await.unwrap());
    }

    #[tokio::test]
    async fn test_renewal_returns_same_token() {
        let store = InMemoryStore::new();
        let locks = quick_service(store);
        let cancel = CancelFlag::new();

        let t1 = locks.acquire("jobs", "worker-1", 30, &cancel).await.unwrap();
        let t2 = locks.acquire("jobs", "worker-1", 30, &cancel).await.unwrap();
        let t3 = locks.acquire("jobs", "worker-1", 30, &cancel).await.unwrap();
        assert_eq!(t1, t2);
        assert_eq!(t2, t3);
    }

    #[tokio::test]
    async fn test_takeover_after_lease_expiry() {
        let store = InMemoryStore::new();
        let locks = quick_service(store.clone());
        let cancel = CancelFlag::new();

        let t1 = locks.acquire("jobs", "worker-1", 30, &cancel).await.unwrap();
        store.expire(&lease_key("worker-1")).await;

        let t2 = locks.acquire("jobs", "worker-2", 30, &cancel).await.unwrap();
        assert!(t2 > t1);
        assert!(!locks.validate("jobs", "worker-1", t1).await.unwrap());
        assert!(locks.validate("jobs", "worker-2", t2).await.unwrap());
    }

    #[tokio::test]
    async fn test_held_lock_blocks_until_policy_exhausted() {
        let store = InMemoryStore::new();
        let config = LockConfig {
            retry_interval: Duration::from_millis(1),
        };
        let retry = RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            ..RetryPolicy::default()
        }
        .with_max_retries(3);
        let locks = LockService::new(store, config, retry);
        let cancel = CancelFlag::new();

        locks.acquire("jobs", "worker-1", 30, &cancel).await.unwrap();
        let result = locks.acquire("jobs", "worker-2", 30, &cancel).await;
        assert!(matches!(result, Err(CoordinationError::MaxRetriesExceeded { .. })));

        // The loser never disturbed the holder.
        let token = locks.acquire("jobs", "worker-1", 30, &cancel).await.unwrap();
        assert_eq!(token, FencingToken(1));
    }

    #[tokio::test]
    async fn test_validate_rejects_stale_and_wrong() {
        let store = InMemoryStore::new();
        let locks = quick_service(store.clone());
        let cancel = CancelFlag::new();

        let t1 = locks.acquire("jobs", "worker-1", 30, &cancel).await.unwrap();
        assert!(!locks.validate("jobs", "worker-1", FencingToken(t1.value() + 1)).await.unwrap());
        assert!(!locks.validate("jobs", "worker-2", t1).await.unwrap());
        assert!(!locks.validate("missing", "worker-1", t1).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_lets_next_owner_take_over() {
        let store = InMemoryStore::new();
        let locks = quick_service(store);
        let cancel = CancelFlag::new();

        let t1 = locks.acquire("jobs", "worker-1", 30, &cancel).await.unwrap();
        locks.release("jobs", "worker-1", t1).await.unwrap();
        // Double release is harmless.
        locks.release("jobs", "worker-1", t1).await.unwrap();

        let t2 = locks.acquire("jobs", "worker-2", 30, &cancel).await.unwrap();
        assert!(t2 > t1);
        assert!(!locks.validate("jobs", "worker-1", t1).await.unwrap());
    }

    #[tokio::test]
    async fn test_fence_monotonic_across_successions() {
        let store = InMemoryStore::new();
        let locks = quick_service(store.clone());
        let cancel = CancelFlag::new();

        let mut last = FencingToken(0);
        for owner in ["a", "b", "c", "d"] {
            let token = locks.acquire("jobs", owner, 30, &cancel).await.unwrap();
            assert!(token > last);
            last = token;
            store.expire(&lease_key(owner)).await;
        }
        assert_eq!(last, FencingToken(4));
    }

    #[tokio::test]
    async fn test_unowned_record_is_taken_over() {
        let store = InMemoryStore::new();
        let locks = quick_service(store.clone());
        let cancel = CancelFlag::new();

        // A record left unowned keeps its fence history.
        let record = LockRecord {
            name: "jobs".into(),
            owner_id: String::new(),
            fence_token: 5,
            entity_type: LockRecord::ENTITY.into(),
        };
        store
            .create(&lock_key("jobs"), &serde_json::to_string(&record).unwrap())
            .await
            .unwrap();

        let token = locks.acquire("jobs", "worker-1", 30, &cancel).await.unwrap();
        assert_eq!(token, FencingToken(6));
    }

    #[tokio::test]
    async fn test_transient_store_errors_are_absorbed() {
        let store = InMemoryStore::new();
        let locks = quick_service(store.clone());
        let cancel = CancelFlag::new();

        store.fail_next(StoreError::Throttled { retry_after_ms: 1 }).await;
        store.fail_next(StoreError::Timeout { duration_ms: 1 }).await;

        let token = locks.acquire("jobs", "worker-1", 30, &cancel).await.unwrap();
        assert_eq!(token, FencingToken(1));
    }

    #[tokio::test]
    async fn test_cancellation_stops_waiting_on_held_lock() {
        let store = InMemoryStore::new();
        let locks = quick_service(store);
        let cancel = CancelFlag::new();

        locks.acquire("jobs", "worker-1", 30, &cancel).await.unwrap();

        let cancelled = CancelFlag::new();
        cancelled.cancel();
        let result = locks.acquire("jobs", "worker-2", 30, &cancelled).await;
        assert!(matches!(result, Err(CoordinationError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_list_locks() {
        let store = InMemoryStore::new();
        let locks = quick_service(store);
        let cancel = CancelFlag::new();

        locks.acquire("jobs", "worker-1", 30, &cancel).await.unwrap();
        locks.acquire("mail", "worker-2", 30, &cancel).await.unwrap();

        let mut all = locks.list().await.unwrap();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "jobs");
        assert_eq!(all[1].name, "mail");
    }
}
