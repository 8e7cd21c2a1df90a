//! The in-progress batch owned by a coalescer.

use std::mem;

use chainbatch_core::{BatchId, SealTrigger, SealedBatch};

/// Collects items for the open batch until it is sealed.
///
/// Not synchronised; the coalescer keeps it behind its lock.
#[derive(Debug)]
pub struct BatchAccumulator<K> {
    batch_id: BatchId,
    items: Vec<K>,
    max_items: usize,
}

impl<K> BatchAccumulator<K> {
    pub fn new(max_items: usize) -> Self {
        Self {
            batch_id: BatchId::new(),
            items: Vec::with_capacity(max_items),
            max_items,
        }
    }

    /// Id of the open batch.
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_items
    }

    /// Append an item, returning the id of the batch it joined.
    pub fn push(&mut self, item: K) -> BatchId {
        self.items.push(item);
        self.batch_id
    }

    /// Freeze the open batch and start a fresh one under a new id.
    ///
    /// Returns `None` and changes nothing when no items are pending.
    pub fn seal(&mut self, trigger: SealTrigger) -> Option<SealedBatch<K>> {
        if self.items.is_empty() {
            return None;
        }
        let items = mem::replace(&mut self.items, Vec::with_capacity(self.max_items));
        let id = mem::replace(&mut self.batch_id, BatchId::new());
        Some(SealedBatch { id, items, trigger })
    }
}
