//! Injectable randomness for shard selection and retry jitter.
//!
//! Shard picks and backoff jitter go through [`RandomSource`] so
//! contention spread and tie-break scenarios are reproducible in
//! tests. Production code uses [`ThreadRandom`].

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use rand::Rng;

/// Source of uniform random values.
pub trait RandomSource: Send + Sync {
    /// Uniform value in `[0, bound)`. `bound` must be non-zero.
    fn pick(&self, bound: u64) -> u64;
}

/// Default source backed by the thread-local generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn pick(&self, bound: u64) -> u64 {
        // Create rng here to avoid holding non-Send type across await
        rand::rng().random_range(0..bound)
    }
}

/// Deterministic source for tests: cycles through fixed values.
#[derive(Debug)]
pub struct FixedRandom {
    values: Vec<u64>,
    next: AtomicUsize,
}

impl FixedRandom {
    /// Cycle through `values`, each reduced modulo the requested bound.
    pub fn new(values: Vec<u64>) -> Self {
        assert!(!values.is_empty(), "FixedRandom needs at least one value");
        Self {
            values,
            next: AtomicUsize::new(0),
        }
    }
}

impl RandomSource for FixedRandom {
    fn pick(&self, bound: u64) -> u64 {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.values.len();
        self.values[index] % bound
    }
}
