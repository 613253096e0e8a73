//! Retry policy and cooperative cancellation.
//!
//! Conflicts, throttling and timeouts are resolved by re-reading and
//! retrying; the policy object makes that loop explicit, injectable
//! and bounded in tests. [`RetryPolicy::unbounded`] retries forever,
//! limited only by the caller's [`CancelFlag`], which is checked
//! between iterations. An in-flight store call is never interrupted.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use crate::error::{CancelledSnafu, CoordinationError, MaxRetriesExceededSnafu, TimeoutSnafu};
use crate::random::RandomSource;

/// Caller-supplied active flag for long-running retry loops.
///
/// Cloned handles share the same flag. Cancelling makes every loop
/// observing the flag stop at its next iteration boundary.
#[derive(Debug, Default, Clone)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create a flag in the active (not cancelled) state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cooperative shutdown.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once `cancel` has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounds and backoff shape for a retry loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum retries after the first attempt. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Wall-clock budget for the whole operation. `None` is unbounded.
    pub deadline: Option<Duration>,
    /// First delay between attempts.
    pub initial_backoff: Duration,
    /// Ceiling for the exponential backoff.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            deadline: None,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Retry forever, bounded only by caller cancellation.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Limit the number of retries after the first attempt.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Limit the operation's total wall-clock time.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Start tracking one operation's retries.
    pub fn session(&self, operation: impl Into<String>) -> RetrySession {
        RetrySession {
            operation: operation.into(),
            max_retries: self.max_retries,
            deadline: self.deadline.map(|d| Instant::now() + d),
            backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            retries: 0,
        }
    }
}

/// Per-operation retry state created by [`RetryPolicy::session`].
#[derive(Debug)]
pub struct RetrySession {
    operation: String,
    max_retries: Option<u32>,
    deadline: Option<Instant>,
    backoff: Duration,
    max_backoff: Duration,
    retries: u32,
}

impl RetrySession {
    /// Record a failed attempt and wait with exponential backoff and
    /// jitter. Errors once the policy bounds or the flag say stop.
    pub async fn pause(
        &mut self,
        rand: &dyn RandomSource,
        cancel: &CancelFlag,
    ) -> Result<(), CoordinationError> {
        self.record_retry(cancel)?;
        let jitter_ms = rand.pick(self.backoff.as_millis() as u64 / 2 + 1);
        tokio::time::sleep(self.backoff + Duration::from_millis(jitter_ms)).await;
        self.backoff = (self.backoff * 2).min(self.max_backoff);
        Ok(())
    }

    /// Record a failed attempt and wait a fixed interval. Used where
    /// the protocol specifies a flat retry interval instead of backoff.
    pub async fn pause_for(
        &mut self,
        interval: Duration,
        cancel: &CancelFlag,
    ) -> Result<(), CoordinationError> {
        self.record_retry(cancel)?;
        tokio::time::sleep(interval).await;
        Ok(())
    }

    fn record_retry(&mut self, cancel: &CancelFlag) -> Result<(), CoordinationError> {
        if cancel.is_cancelled() {
            return CancelledSnafu {
                operation: self.operation.clone(),
            }
            .fail();
        }
        self.retries += 1;
        if let Some(max) = self.max_retries {
            if self.retries > max {
                return MaxRetriesExceededSnafu {
                    operation: self.operation.clone(),
                    attempts: self.retries,
                }
                .fail();
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return TimeoutSnafu {
                    operation: self.operation.clone(),
                }
                .fail();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::FixedRandom;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_backoff_doubles_and_clamps() {
        let mut session = quick_policy().session("test");
        let rand = FixedRandom::new(vec![0]);
        let cancel = CancelFlag::new();

        for _ in 0..4 {
            session.pause(&rand, &cancel).await.unwrap();
        }
        assert_eq!(session.backoff, Duration::from_millis(4));
    }

    #[tokio::test]
    async fn test_max_retries_exhaustion() {
        let mut session = quick_policy().with_max_retries(2).session("test");
        let rand = FixedRandom::new(vec![0]);
        let cancel = CancelFlag::new();

        session.pause(&rand, &cancel).await.unwrap();
        session.pause(&rand, &cancel).await.unwrap();
        let result = session.pause(&rand, &cancel).await;
        assert!(matches!(result, Err(CoordinationError::MaxRetriesExceeded { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn test_deadline_exhaustion() {
        let mut session = quick_policy().with_deadline(Duration::ZERO).session("test");
        let rand = FixedRandom::new(vec![0]);
        let cancel = CancelFlag::new();

        let result = session.pause(&rand, &cancel).await;
        assert!(matches!(result, Err(CoordinationError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_cancellation_observed_between_retries() {
        let mut session = quick_policy().session("test");
        let rand = FixedRandom::new(vec![0]);
        let cancel = CancelFlag::new();

        session.pause(&rand, &cancel).await.unwrap();
        cancel.cancel();
        let result = session.pause(&rand, &cancel).await;
        assert!(matches!(result, Err(CoordinationError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_fixed_interval_counts_toward_bounds() {
        let mut session = quick_policy().with_max_retries(1).session("test");
        let cancel = CancelFlag::new();

        session.pause_for(Duration::from_millis(1), &cancel).await.unwrap();
        let result = session.pause_for(Duration::from_millis(1), &cancel).await;
        assert!(matches!(result, Err(CoordinationError::MaxRetriesExceeded { .. })));
    }
}
