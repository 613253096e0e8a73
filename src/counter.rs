//! Sharded distributed counter.
//!
//! A logical counter is split into N shard records whose counts sum
//! to the aggregate. Writers pick a shard at random and apply their
//! delta with a version-guarded field increment, so contention spreads
//! across shards instead of serializing on one record. Bounds are
//! enforced twice: a racy fail-fast pre-check against the aggregate,
//! and a post-write re-verify that compensates the shard and rejects
//! the update if a concurrent writer pushed the total out of range.

use std::sync::Arc;

use tracing::debug;
use tracing::warn;

use crate::error::{CoordinationError, CorruptedDataSnafu, LimitExceededSnafu};
use crate::random::{RandomSource, ThreadRandom};
use crate::retry::{CancelFlag, RetryPolicy};
use crate::store::{shard_key, ConditionalStore, StoreError, Version};
use crate::types::CounterShard;

/// Configuration for a sharded counter.
#[derive(Debug, Clone)]
pub struct CounterConfig {
    /// Number of shard records. More shards, less write contention.
    pub shard_count: u32,
    /// Lower bound for the aggregate value.
    pub min: i64,
    /// Upper bound for the aggregate value.
    pub max: i64,
    /// Enforce bounds on update. Costs an aggregate read per update.
    pub check_limits: bool,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            shard_count: 4,
            min: i64::MIN,
            max: i64::MAX,
            check_limits: false,
        }
    }
}

/// Handle to one logical sharded counter.
pub struct ShardedCounter<S: ConditionalStore + ?Sized> {
    store: Arc<S>,
    name: String,
    config: CounterConfig,
    retry: RetryPolicy,
    rand: Arc<dyn RandomSource>,
}

impl<S: ConditionalStore + ?Sized> ShardedCounter<S> {
    /// Create the counter named `name`, replacing any prior shards.
    ///
    /// Existing shards for the name are deleted first, then
    /// `shard_count` fresh records are written; shard 1 is seeded with
    /// `initial_count`, all others start at zero.
    pub async fn create(
        store: Arc<S>,
        name: impl Into<String>,
        initial_count: i64,
        config: CounterConfig,
        retry: RetryPolicy,
    ) -> Result<Self, CoordinationError> {
        assert!(config.shard_count >= 1, "counter needs at least one shard");
        let counter = Self {
            store,
            name: name.into(),
            config,
            retry,
            rand: Arc::new(ThreadRandom),
        };

        counter.reset().await?;
        for index in 1..=counter.config.shard_count {
            let count = if index == 1 { initial_count } else { 0 };
            let shard = CounterShard::new(
                &counter.name,
                index,
                count,
                counter.config.min,
                counter.config.max,
            );
            counter.write_shard(index, &shard).await?;
        }
        debug!(
            counter = %counter.name,
            shards = counter.config.shard_count,
            initial_count,
            "counter created"
        );
        Ok(counter)
    }

    /// Replace the randomness used for shard selection and jitter.
    pub fn with_random_source(mut self, rand: Arc<dyn RandomSource>) -> Self {
        self.rand = rand;
        self
    }

    /// The logical counter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply `delta` to the counter.
    ///
    /// `order_id` only labels log output so interleaved workers can be
    /// told apart. Conflicts, throttling and timeouts are retried under
    /// the counter's policy; `cancel` is observed between retries. A
    /// bound violation surfaces as `LimitExceeded`, with `rolled_back`
    /// telling whether the aggregate is clean of the rejected delta.
    pub async fn update(
        &self,
        order_id: u64,
        delta: i64,
        cancel: &CancelFlag,
    ) -> Result<(), CoordinationError> {
        if self.config.check_limits {
            let aggregate = self.count().await?;
            if self.out_of_bounds(aggregate.saturating_add(delta)) {
                debug!(counter = %self.name, order_id, aggregate, delta, "rejected by pre-check");
                return LimitExceededSnafu {
                    counter: self.name.clone(),
                    delta,
                    min: self.config.min,
                    max: self.config.max,
                    rolled_back: true,
                }
                .fail();
            }
        }

        // Spread writers uniformly over all shards.
        let index = self.rand.pick(u64::from(self.config.shard_count)) as u32 + 1;
        let key = shard_key(&self.name, index);
        let mut session = self.retry.session(format!("counter update for '{}'", self.name));

        loop {
            let version = match self.read_or_init_shard(index).await {
                Ok((_, version)) => version,
                Err(e) if e.is_retryable_storage() => {
                    session.pause(self.rand.as_ref(), cancel).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self
                .store
                .conditional_increment(&key, "count", delta, version)
                .await
            {
                Ok(new_version) => {
                    debug!(counter = %self.name, order_id, shard = index, delta, "shard updated");
                    if self.config.check_limits {
                        let aggregate = self.count().await?;
                        if self.out_of_bounds(aggregate) {
                            // A concurrent writer moved the total while
                            // we were between pre-check and write.
                            let rolled_back =
                                self.rollback(&key, delta, new_version, cancel).await;
                            warn!(
                                counter = %self.name,
                                order_id,
                                aggregate,
                                rolled_back,
                                "limit breached after write"
                            );
                            return LimitExceededSnafu {
                                counter: self.name.clone(),
                                delta,
                                min: self.config.min,
                                max: self.config.max,
                                rolled_back,
                            }
                            .fail();
                        }
                    }
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    debug!(counter = %self.name, order_id, shard = index, error = %e, "shard write contended");
                    session.pause(self.rand.as_ref(), cancel).await?;
                }
                Err(StoreError::NotFound { .. }) => {
                    // Shard vanished under us (counter being recreated);
                    // the next read initializes it again.
                    session.pause(self.rand.as_ref(), cancel).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Current aggregate value: the sum over all shards.
    ///
    /// This is a snapshot, not synchronized with concurrent updates;
    /// callers must tolerate a momentarily stale total.
    pub async fn count(&self) -> Result<i64, CoordinationError> {
        let docs = self
            .store
            .query_by_field("partition_id", &self.name)
            .await?;
        let mut total = 0i64;
        for doc in &docs {
            let shard: CounterShard = serde_json::from_str(&doc.body).map_err(|e| {
                CorruptedDataSnafu {
                    key: doc.key.clone(),
                    reason: e.to_string(),
                }
                .build()
            })?;
            total = total.saturating_add(shard.count);
        }
        Ok(total)
    }

    fn out_of_bounds(&self, aggregate: i64) -> bool {
        aggregate > self.config.max || aggregate < self.config.min
    }

    /// Delete every shard currently recorded for this counter name.
    async fn reset(&self) -> Result<(), CoordinationError> {
        let docs = self
            .store
            .query_by_field("partition_id", &self.name)
            .await?;
        for doc in &docs {
            self.store.delete(&doc.key).await?;
        }
        if !docs.is_empty() {
            debug!(counter = %self.name, shards = docs.len(), "previous shards deleted");
        }
        Ok(())
    }

    /// Write one shard record, overwriting a racing creator's record
    /// so the latest generation wins.
    async fn write_shard(&self, index: u32, shard: &CounterShard) -> Result<(), CoordinationError> {
        let key = shard_key(&self.name, index);
        let body = serde_json::to_string(shard)?;
        match self.store.create(&key, &body).await {
            Ok(_) => Ok(()),
            Err(StoreError::AlreadyExists { .. }) => {
                let doc = self.store.get(&key).await?;
                self.store.conditional_put(&key, &body, doc.version).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read shard `index`, creating a zero-valued record if the store
    /// has none. Tolerates partial prior failures.
    async fn read_or_init_shard(
        &self,
        index: u32,
    ) -> Result<(CounterShard, Version), CoordinationError> {
        let key = shard_key(&self.name, index);
        match self.read_shard(&key).await? {
            Some(pair) => Ok(pair),
            None => {
                let shard =
                    CounterShard::new(&self.name, index, 0, self.config.min, self.config.max);
                let body = serde_json::to_string(&shard)?;
                match self.store.create(&key, &body).await {
                    Ok(version) => Ok((shard, version)),
                    Err(StoreError::AlreadyExists { .. }) => match self.read_shard(&key).await? {
                        Some(pair) => Ok(pair),
                        // Created and deleted again before our read:
                        // surface as a conflict so the caller retries.
                        None => Err(StoreError::VersionConflict { key }.into()),
                    },
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn read_shard(
        &self,
        key: &str,
    ) -> Result<Option<(CounterShard, Version)>, CoordinationError> {
        match self.store.get(key).await {
            Ok(doc) => {
                let shard: CounterShard = serde_json::from_str(&doc.body).map_err(|e| {
                    CorruptedDataSnafu {
                        key: key.to_string(),
                        reason: e.to_string(),
                    }
                    .build()
                })?;
                Ok(Some((shard, doc.version)))
            }
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Compensate a shard write after a post-write limit violation.
    ///
    /// Retried against conflicts like a normal update, but failures
    /// stay here: the caller reports `LimitExceeded` either way, with
    /// the returned flag saying whether compensation was confirmed.
    async fn rollback(
        &self,
        key: &str,
        delta: i64,
        version_after: Version,
        cancel: &CancelFlag,
    ) -> bool {
        let mut session = self.retry.session(format!("counter rollback for '{}'", self.name));
        let mut expected = version_after;

        loop {
            match self
                .store
                .conditional_increment(key, "count", -delta, expected)
                .await
            {
                Ok(_) => {
                    debug!(counter = %self.name, delta = -delta, "rollback applied");
                    return true;
                }
                Err(e) if e.is_retryable() => {
                    if session.pause(self.rand.as_ref(), cancel).await.is_err() {
                        return false;
                    }
                    match self.store.get(key).await {
                        Ok(doc) => expected = doc.version,
                        // Shard deleted out from under us; our delta
                        // went with it, nothing left to compensate.
                        Err(StoreError::NotFound { .. }) => return true,
                        // Leave the stale version in place; the next
                        // attempt conflicts and re-reads after a pause.
                        Err(_) => {}
                    }
                }
                Err(StoreError::NotFound { .. }) => return true,
                Err(_) => return false,
            }
        }
    }
}
