//! Error types for coordination primitives.

use snafu::Snafu;

use crate::store::StoreError;

/// Errors from coordination primitives.
///
/// Retryable store kinds (conflicts, throttling, timeouts, expected
/// not-founds) are absorbed inside the components; what crosses the
/// boundary is limit rejection, retry-policy exhaustion, cancellation,
/// or a fatal backend failure.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CoordinationError {
    /// Counter update rejected because it would breach the bounds.
    #[snafu(display(
        "counter '{counter}' limit exceeded: delta {delta} leaves aggregate outside [{min}, {max}] (rolled_back: {rolled_back})"
    ))]
    LimitExceeded {
        /// Logical counter name.
        counter: String,
        /// The rejected delta.
        delta: i64,
        /// Lower bound of the counter.
        min: i64,
        /// Upper bound of the counter.
        max: i64,
        /// Whether the compensating write was confirmed applied.
        rolled_back: bool,
    },

    /// Operation exceeded its retry-policy deadline.
    #[snafu(display("operation timed out: {operation}"))]
    Timeout {
        /// Description of the operation.
        operation: String,
    },

    /// Operation exhausted its retry-policy attempt budget.
    #[snafu(display("max retries exceeded for {operation}: {attempts} attempts"))]
    MaxRetriesExceeded {
        /// Description of the operation.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
    },

    /// Caller cancelled the operation between retries.
    #[snafu(display("operation cancelled: {operation}"))]
    Cancelled {
        /// Description of the operation.
        operation: String,
    },

    /// Data in storage is corrupted or unparseable.
    #[snafu(display("corrupted data in key '{key}': {reason}"))]
    CorruptedData {
        /// The key with corrupted data.
        key: String,
        /// Description of what went wrong.
        reason: String,
    },

    /// Unrecoverable backend error, propagated unmodified.
    #[snafu(display("storage error: {source}"))]
    Storage {
        /// The underlying error.
        source: StoreError,
    },

    /// JSON serialization/deserialization error.
    #[snafu(display("serialization error: {source}"))]
    Serialization {
        /// The underlying error.
        source: serde_json::Error,
    },
}

impl CoordinationError {
    /// True if this is a limit rejection from a counter update.
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, CoordinationError::LimitExceeded { .. })
    }

    /// True if this wraps a store kind resolved by re-reading and
    /// retrying. Such errors should never escape a retry loop.
    pub fn is_retryable_storage(&self) -> bool {
        matches!(self, CoordinationError::Storage { source } if source.is_retryable())
    }
}

impl From<StoreError> for CoordinationError {
    fn from(source: StoreError) -> Self {
        CoordinationError::Storage { source }
    }
}

impl From<serde_json::Error> for CoordinationError {
    fn from(source: serde_json::Error) -> Self {
        CoordinationError::Serialization { source }
    }
}
