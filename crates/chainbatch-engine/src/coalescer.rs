//! `Coalescer`: groups registered items into batches by count or time.
//!
//! ```text
//! register ──► [accumulator] ──(len == max)────────► seal ─┐
//!                   ▲        ──(timer elapsed, len > 0)─► seal ─┤
//!                   └──────────── fresh batch id ◄──────────────┘
//!                                                           │ lock released
//!                                                           ▼
//!                                                   batch-ready listeners
//! ```
//!
//! The accumulator and the countdown share one mutex. Seal decisions are made
//! under it; listeners are always invoked after it is released, so a listener
//! may call back into the coalescer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, trace};

use chainbatch_core::{BatchId, BatchItem, BatcherConfig, SealTrigger, SealedBatch};

use crate::accumulator::BatchAccumulator;
use crate::timer::Countdown;

/// Callback invoked with every sealed batch.
pub type BatchListener<K> = Arc<dyn Fn(SealedBatch<K>) + Send + Sync>;

struct CoalescerState<K> {
    accumulator: BatchAccumulator<K>,
    timer: Countdown,
}

/// Count/time batching state machine.
///
/// Each instance owns its own listener list; there is no shared event state
/// between coalescers.
pub struct Coalescer<K: BatchItem> {
    state: Mutex<CoalescerState<K>>,
    listeners: RwLock<Vec<BatchListener<K>>>,
    this: Weak<Self>,
}

impl<K: BatchItem> Coalescer<K> {
    /// Create a coalescer sealing at `max_batch_size` items or after
    /// `max_batch_wait`, whichever comes first.
    ///
    /// # Panics
    /// Must be called from within a Tokio runtime; the countdown is spawned
    /// onto it.
    pub fn new(max_batch_size: usize, max_batch_wait: Duration) -> Arc<Self> {
        let runtime = Handle::current();
        Arc::new_cyclic(|this| Self {
            state: Mutex::new(CoalescerState {
                accumulator: BatchAccumulator::new(max_batch_size.max(1)),
                timer: Countdown::new(max_batch_wait, runtime),
            }),
            listeners: RwLock::new(Vec::new()),
            this: this.clone(),
        })
    }

    pub fn from_config(config: &BatcherConfig) -> Arc<Self> {
        Self::new(config.max_batch_size, config.max_batch_wait())
    }

    /// Register a batch-ready listener. Listeners run in registration order.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(SealedBatch<K>) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Add `item` to the open batch and return the id of the batch it joined.
    ///
    /// Seals the batch when it reaches the size threshold; otherwise makes
    /// sure the countdown is running.
    pub fn register(&self, item: K) -> BatchId {
        let (batch_id, sealed) = {
            let mut state = self.lock();
            let batch_id = state.accumulator.push(item);
            if state.accumulator.is_full() {
                state.timer.disarm();
                (batch_id, state.accumulator.seal(SealTrigger::Count))
            } else {
                self.arm_timer(&mut state);
                (batch_id, None)
            }
        };
        if let Some(batch) = sealed {
            self.emit(batch);
        }
        batch_id
    }

    /// Seal the open batch now, if it has any items.
    pub fn flush(&self) -> Option<BatchId> {
        let sealed = {
            let mut state = self.lock();
            state.timer.disarm();
            state.accumulator.seal(SealTrigger::Flush)
        };
        let batch = sealed?;
        let id = batch.id;
        self.emit(batch);
        Some(id)
    }

    /// Items waiting in the open batch.
    pub fn pending_len(&self) -> usize {
        self.lock().accumulator.len()
    }

    pub fn current_batch_id(&self) -> BatchId {
        self.lock().accumulator.batch_id()
    }

    pub fn is_timer_armed(&self) -> bool {
        self.lock().timer.is_armed()
    }

    pub fn max_batch_size(&self) -> usize {
        self.lock().accumulator.max_items()
    }

    fn on_elapsed(&self, generation: u64) {
        let sealed = {
            let mut state = self.lock();
            if !state.timer.take_elapsed(generation) {
                trace!(generation, "ignoring stale batch timer");
                return;
            }
            state.accumulator.seal(SealTrigger::Timer)
        };
        let Some(batch) = sealed else {
            trace!("batch window elapsed with nothing pending");
            return;
        };
        self.emit(batch);

        // Next window. No-op if a registration already re-armed it.
        let mut state = self.lock();
        self.arm_timer(&mut state);
    }

    fn arm_timer(&self, state: &mut CoalescerState<K>) {
        let this = self.this.clone();
        state.timer.arm(move |generation| {
            if let Some(coalescer) = this.upgrade() {
                coalescer.on_elapsed(generation);
            }
        });
    }

    fn emit(&self, batch: SealedBatch<K>) {
        debug!(
            batch = %batch.id,
            size = batch.len(),
            trigger = %batch.trigger,
            "batch sealed"
        );
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &listeners {
            listener(batch.clone());
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoalescerState<K>> {
        // Every critical section leaves the state consistent, so a panic
        // elsewhere while holding the lock does not invalidate it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: BatchItem> std::fmt::Debug for Coalescer<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Coalescer")
            .field("batch_id", &state.accumulator.batch_id())
            .field("pending", &state.accumulator.len())
            .field("timer", &state.timer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    type Seen = Arc<Mutex<Vec<SealedBatch<u64>>>>;

    fn recording(max: usize, wait_ms: u64) -> (Arc<Coalescer<u64>>, Seen) {
        let coalescer = Coalescer::new(max, Duration::from_millis(wait_ms));
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        coalescer.subscribe(move |batch| sink.lock().unwrap().push(batch));
        (coalescer, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn count_threshold_seals_in_submission_order() {
        let (c, seen) = recording(3, 60_000);

        let ids: Vec<BatchId> = [5, 1, 9].into_iter().map(|i| c.register(i)).collect();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].items, vec![5, 1, 9]);
        assert_eq!(seen[0].trigger, SealTrigger::Count);
        assert!(ids.iter().all(|id| *id == seen[0].id));
        assert_ne!(c.current_batch_id(), seen[0].id);
        assert!(!c.is_timer_armed(), "count seal stops the timer");
        assert_eq!(c.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_threshold_seals_partial_batch() {
        let (c, seen) = recording(10, 50);

        let id = c.register(1);
        c.register(2);
        assert!(c.is_timer_armed());
        assert!(seen.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].id, id);
        assert_eq!(seen[0].items, vec![1, 2]);
        assert_eq!(seen[0].trigger, SealTrigger::Timer);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer_stays_unarmed() {
        let (c, seen) = recording(10, 50);

        c.register(1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(c.is_timer_armed(), "re-armed after a timer seal");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(seen.lock().unwrap().len(), 1, "no event for an empty window");
        assert!(!c.is_timer_armed(), "idle window leaves the timer unarmed");

        c.register(2);
        assert!(c.is_timer_armed(), "registration re-arms");
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max() {
        let (c, seen) = recording(3, 60_000);
        for i in 1..=7 {
            c.register(i);
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].items, vec![1, 2, 3]);
        assert_eq!(seen[1].items, vec![4, 5, 6]);
        assert_eq!(c.pending_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_seals_open_batch_once() {
        let (c, seen) = recording(10, 60_000);
        let id = c.register(4);
        c.register(5);

        assert_eq!(c.flush(), Some(id));
        assert_eq!(c.flush(), None);
        assert!(!c.is_timer_armed());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].trigger, SealTrigger::Flush);
        assert_eq!(seen[0].items, vec![4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn listener_may_reenter() {
        let c = Coalescer::<u64>::new(2, Duration::from_secs(60));
        let weak = Arc::downgrade(&c);
        let observed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        c.subscribe(move |_batch| {
            // Would deadlock if listeners ran under the coalescer lock.
            let coalescer = weak.upgrade().unwrap();
            *sink.lock().unwrap() = Some(coalescer.pending_len());
        });

        c.register(1);
        c.register(2);
        assert_eq!(*observed.lock().unwrap(), Some(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registration_loses_nothing() {
        let (c, seen) = recording(7, 60_000);

        let mut tasks = Vec::new();
        for worker in 0..8u64 {
            let c = Arc::clone(&c);
            tasks.push(tokio::spawn(async move {
                (0..100u64)
                    .map(|n| {
                        let item = worker * 1_000 + n;
                        (item, c.register(item))
                    })
                    .collect::<Vec<_>>()
            }));
        }
        let mut assigned = HashMap::new();
        for task in tasks {
            assigned.extend(task.await.unwrap());
        }
        c.flush();

        let seen = seen.lock().unwrap();
        let mut sealed_in = HashMap::new();
        for batch in seen.iter() {
            assert!(!batch.is_empty() && batch.len() <= 7);
            for item in &batch.items {
                assert!(
                    sealed_in.insert(*item, batch.id).is_none(),
                    "item {item} sealed twice"
                );
            }
        }
        assert_eq!(sealed_in.len(), 800);
        // The id handed back by `register` is the batch the item was sealed in.
        assert_eq!(sealed_in, assigned);
    }
}
