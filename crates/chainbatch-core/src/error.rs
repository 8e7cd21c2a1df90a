//! Error types for batching, workers and configuration.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::item::BatchId;

/// A failure the worker reported for a single item inside an otherwise
/// successful batch response. Only that item's caller sees it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ItemFailure {
    pub message: String,
}

impl ItemFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Whole-call outcome of a worker that did not produce results.
#[derive(Debug, Clone, Error)]
pub enum ConvertError {
    /// The worker call raised an error. Shared so the same value reaches every
    /// member of the batch.
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),

    /// The worker call was cancelled.
    #[error("conversion cancelled")]
    Cancelled,
}

impl ConvertError {
    /// Wrap any error as a whole-batch failure.
    pub fn failed<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::Failed(Arc::new(err.into()))
    }

    /// Build a whole-batch failure from a message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::Failed(Arc::new(anyhow::Error::msg(message)))
    }
}

/// Defects in the batcher's own bookkeeping or a worker contract breach.
///
/// These are never business errors. They are logged at `error` level and
/// delivered to the affected callers so that nobody waits forever.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("batch {batch}: worker returned {actual} results for {expected} items")]
    ResultCountMismatch {
        batch: BatchId,
        expected: usize,
        actual: usize,
    },

    #[error("batch {batch}: worker returned a result for non-member item {item}")]
    UnknownResultItem { batch: BatchId, item: String },

    #[error("batch {batch}: worker returned more than one result for item {item}")]
    DuplicateResult { batch: BatchId, item: String },

    #[error("batch {batch}: completion for item {item} vanished before resolution")]
    MissingCompletion { batch: BatchId, item: String },

    #[error("batch {batch} has no membership record")]
    MissingMembership { batch: BatchId },

    #[error("batch {batch}: item {item} still pending after resolution")]
    UnresolvedCompletion { batch: BatchId, item: String },
}

impl InvariantViolation {
    /// The batch the violation was detected in.
    pub fn batch(&self) -> BatchId {
        match self {
            Self::ResultCountMismatch { batch, .. }
            | Self::UnknownResultItem { batch, .. }
            | Self::DuplicateResult { batch, .. }
            | Self::MissingCompletion { batch, .. }
            | Self::MissingMembership { batch }
            | Self::UnresolvedCompletion { batch, .. } => *batch,
        }
    }
}

/// Errors a caller of `submit` can observe.
#[derive(Debug, Clone, Error)]
pub enum BatchError {
    /// The item already has a live pending completion.
    #[error("item {item} is already pending")]
    DuplicateItem { item: String },

    /// The worker call for the item's batch failed as a whole.
    #[error("batch {batch} failed: {error}")]
    WorkerFailed {
        batch: BatchId,
        error: Arc<anyhow::Error>,
    },

    /// The worker call for the item's batch was cancelled.
    #[error("batch {batch} was cancelled")]
    Cancelled { batch: BatchId },

    /// The worker reported a failure for this item only.
    #[error("item failed: {0}")]
    Item(ItemFailure),

    /// The batcher detected a bookkeeping defect while resolving the batch.
    #[error("invariant violated: {0}")]
    Invariant(InvariantViolation),

    /// The processor is shut down and no longer accepts items.
    #[error("batch processor is closed")]
    Closed,
}

impl BatchError {
    /// Returns `true` if resubmitting the item may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WorkerFailed { .. } | Self::Cancelled { .. })
    }

    /// Returns `true` if this error signals a defect rather than a business failure.
    pub fn is_defect(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Invalid configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_batch_size must be at least 1")]
    ZeroBatchSize,

    #[error("max_batch_wait_ms must be greater than 0")]
    ZeroBatchWait,

    #[error("max_concurrent_dispatches must be at least 1")]
    ZeroDispatches,

    #[error("unknown permit policy '{0}' (expected until_complete or until_dispatched)")]
    UnknownPermitPolicy(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_error_shares_the_failure() {
        let err = ConvertError::msg("node unreachable");
        let ConvertError::Failed(inner) = err.clone() else {
            panic!("expected failure");
        };
        let ConvertError::Failed(again) = err else {
            panic!("expected failure");
        };
        assert!(Arc::ptr_eq(&inner, &again));
        assert_eq!(inner.to_string(), "node unreachable");
    }

    #[test]
    fn classification() {
        let batch = BatchId::new();
        assert!(BatchError::Cancelled { batch }.is_retryable());
        assert!(BatchError::Cancelled { batch }.is_cancelled());
        assert!(!BatchError::Closed.is_retryable());

        let defect = BatchError::Invariant(InvariantViolation::MissingMembership { batch });
        assert!(defect.is_defect());
        assert!(!defect.is_retryable());
        assert!(defect.to_string().contains("no membership record"));
    }

    #[test]
    fn violation_reports_its_batch() {
        let batch = BatchId::new();
        let v = InvariantViolation::ResultCountMismatch {
            batch,
            expected: 3,
            actual: 2,
        };
        assert_eq!(v.batch(), batch);
        assert!(v.to_string().contains("2 results for 3 items"));
    }
}
