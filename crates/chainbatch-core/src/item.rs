//! Item identifiers, batch identities and per-item results.

use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ItemFailure;

/// Anything usable as an item identifier.
///
/// Identifiers key the pending-completion registry, so they must be hashable
/// and shareable across tasks. Blanket-implemented for every qualifying type.
pub trait BatchItem: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> BatchItem for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// Globally unique batch identifier (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    /// Generate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a batch was sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SealTrigger {
    /// The accumulator reached `max_batch_size`.
    Count,
    /// The batch window elapsed with at least one item pending.
    Timer,
    /// An explicit flush (e.g. during shutdown).
    Flush,
}

impl fmt::Display for SealTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count => write!(f, "count"),
            Self::Timer => write!(f, "timer"),
            Self::Flush => write!(f, "flush"),
        }
    }
}

/// An immutable batch handed from the coalescer to its listeners.
///
/// `items` keeps submission order. A sealed batch is never empty and never
/// larger than the configured maximum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBatch<K> {
    pub id: BatchId,
    pub items: Vec<K>,
    pub trigger: SealTrigger,
}

impl<K> SealedBatch<K> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// The outcome a worker reports for one item of a batch.
///
/// Every result names the item it belongs to, so a worker may return results
/// in any order.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemResult<K, V> {
    Success { item: K, value: V },
    Failure { item: K, error: ItemFailure },
}

impl<K, V> ItemResult<K, V> {
    pub fn success(item: K, value: V) -> Self {
        Self::Success { item, value }
    }

    pub fn failure(item: K, message: impl Into<String>) -> Self {
        Self::Failure {
            item,
            error: ItemFailure::new(message),
        }
    }

    /// The item this result belongs to.
    pub fn item(&self) -> &K {
        match self {
            Self::Success { item, .. } | Self::Failure { item, .. } => item,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Split into the item id and its outcome.
    pub fn into_parts(self) -> (K, Result<V, ItemFailure>) {
        match self {
            Self::Success { item, value } => (item, Ok(value)),
            Self::Failure { item, error } => (item, Err(error)),
        }
    }
}
