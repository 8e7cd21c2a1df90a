//! Batcher counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use chainbatch_core::SealTrigger;

/// Point-in-time copy of the batcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub items_submitted: u64,
    pub duplicates_rejected: u64,
    pub batches_sealed_by_count: u64,
    pub batches_sealed_by_timer: u64,
    pub batches_sealed_by_flush: u64,
    pub batches_succeeded: u64,
    pub batches_failed: u64,
    pub batches_cancelled: u64,
    pub items_succeeded: u64,
    pub items_failed: u64,
    pub invariant_violations: u64,
}

impl MetricsSnapshot {
    pub fn batches_sealed(&self) -> u64 {
        self.batches_sealed_by_count + self.batches_sealed_by_timer + self.batches_sealed_by_flush
    }
}

/// Lock-free counters shared by the dispatcher and its tasks.
#[derive(Debug, Default)]
pub struct BatcherMetrics {
    items_submitted: AtomicU64,
    duplicates_rejected: AtomicU64,
    batches_sealed_by_count: AtomicU64,
    batches_sealed_by_timer: AtomicU64,
    batches_sealed_by_flush: AtomicU64,
    batches_succeeded: AtomicU64,
    batches_failed: AtomicU64,
    batches_cancelled: AtomicU64,
    items_succeeded: AtomicU64,
    items_failed: AtomicU64,
    invariant_violations: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl BatcherMetrics {
    pub fn record_submitted(&self) {
        bump(&self.items_submitted);
    }

    pub fn record_duplicate(&self) {
        bump(&self.duplicates_rejected);
    }

    pub fn record_sealed(&self, trigger: SealTrigger) {
        match trigger {
            SealTrigger::Count => bump(&self.batches_sealed_by_count),
            SealTrigger::Timer => bump(&self.batches_sealed_by_timer),
            SealTrigger::Flush => bump(&self.batches_sealed_by_flush),
        }
    }

    pub fn record_batch_succeeded(&self) {
        bump(&self.batches_succeeded);
    }

    pub fn record_batch_failed(&self) {
        bump(&self.batches_failed);
    }

    pub fn record_batch_cancelled(&self) {
        bump(&self.batches_cancelled);
    }

    pub fn record_item(&self, succeeded: bool) {
        if succeeded {
            bump(&self.items_succeeded);
        } else {
            bump(&self.items_failed);
        }
    }

    pub fn record_violation(&self) {
        bump(&self.invariant_violations);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            items_submitted: load(&self.items_submitted),
            duplicates_rejected: load(&self.duplicates_rejected),
            batches_sealed_by_count: load(&self.batches_sealed_by_count),
            batches_sealed_by_timer: load(&self.batches_sealed_by_timer),
            batches_sealed_by_flush: load(&self.batches_sealed_by_flush),
            batches_succeeded: load(&self.batches_succeeded),
            batches_failed: load(&self.batches_failed),
            batches_cancelled: load(&self.batches_cancelled),
            items_succeeded: load(&self.items_succeeded),
            items_failed: load(&self.items_failed),
            invariant_violations: load(&self.invariant_violations),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_records() {
        let m = BatcherMetrics::default();
        m.record_submitted();
        m.record_submitted();
        m.record_sealed(SealTrigger::Count);
        m.record_sealed(SealTrigger::Timer);
        m.record_item(true);
        m.record_item(false);
        m.record_violation();

        let s = m.snapshot();
        assert_eq!(s.items_submitted, 2);
        assert_eq!(s.batches_sealed(), 2);
        assert_eq!(s.items_succeeded, 1);
        assert_eq!(s.items_failed, 1);
        assert_eq!(s.invariant_violations, 1);
        assert_eq!(s.batches_sealed_by_flush, 0);
    }
}
