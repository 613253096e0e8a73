//! Coordination primitives built on conditional document writes.
//!
//! This crate provides two primitives for independent processes that
//! share nothing but a document store:
//!
//! - `LockService` - Mutual exclusion with fencing tokens and
//!   lease-bounded ownership
//! - `ShardedCounter` - Bounded shared counter spread over shards for
//!   write throughput
//! - `LeaseManager` - TTL-bound liveness records backing the lock's
//!   failure detection
//!
//! Both primitives are built on the [`ConditionalStore`] trait's
//! version-guarded writes; nothing here takes an in-process lock or a
//! multi-record transaction. The store is injected at construction,
//! and retry behavior and randomness are injectable for tests.
//!
//! ## Lock Example
//!
//! ```ignore
//! use cordon::{CancelFlag, LockConfig, LockService, RetryPolicy};
//!
//! let locks = LockService::new(store, LockConfig::default(), RetryPolicy::unbounded());
//! let cancel = CancelFlag::new();
//!
//! let token = locks.acquire("orders", "worker-1", 30, &cancel).await?;
//!
//! // Pass the fencing token along with protected writes; check it
//! // before each batch of work.
//! if !locks.validate("orders", "worker-1", token).await? {
//!     // Exclusivity is gone, stop immediately.
//! }
//!
//! locks.release("orders", "worker-1", token).await?;
//! ```
//!
//! ## Counter Example
//!
//! ```ignore
//! use cordon::{CancelFlag, CounterConfig, RetryPolicy, ShardedCounter};
//!
//! let config = CounterConfig { shard_count: 4, min: 0, max: 10_000, check_limits: true };
//! let counter = ShardedCounter::create(store, "inventory", 100, config, RetryPolicy::unbounded()).await?;
//!
//! let cancel = CancelFlag::new();
//! counter.update(1, -5, &cancel).await?;
//! let remaining = counter.count().await?;
//! ```

mod counter;
mod error;
mod lease;
mod lock;
pub mod random;
mod retry;
pub mod store;
mod types;

pub use counter::CounterConfig;
pub use counter::ShardedCounter;
pub use error::CoordinationError;
pub use lease::LeaseManager;
pub use lock::LockConfig;
pub use lock::LockService;
pub use random::FixedRandom;
pub use random::RandomSource;
pub use random::ThreadRandom;
pub use retry::CancelFlag;
pub use retry::RetryPolicy;
pub use retry::RetrySession;
pub use store::ConditionalStore;
pub use store::Document;
pub use store::InMemoryStore;
pub use store::StoreError;
pub use store::Version;
pub use types::now_unix_ms;
pub use types::CounterShard;
pub use types::FencingToken;
pub use types::LeaseRecord;
pub use types::LockRecord;
