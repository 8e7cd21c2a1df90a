//! `BatchProcessor`: dispatches sealed batches and routes results back to callers.
//!
//! ```text
//! submit(item) ──► pending registry ──► Coalescer::register
//!                                              │ sealed batch (listener)
//!                                              ▼
//!                      membership registry ◄── on_sealed ──► mpsc ──► dispatch loop
//!                                                                        │ acquire permit
//!                                                                        ▼
//!                                                     spawned worker call (BatchConverter)
//!                                                                        │
//!                          oneshot per item ◄── demux / fan-out ◄────────┘
//! ```
//!
//! Each submitted item gets a `oneshot` completion kept in a `DashMap` keyed by
//! item id. Sealed batches are recorded in a second `DashMap` keyed by batch
//! id and queued to a single dispatch loop, which waits on the permit pool
//! before spawning the worker call. When the call ends, every member of the
//! batch is resolved exactly once and both registries forget it.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace, warn};

use chainbatch_core::{
    BatchConverter, BatchError, BatchId, BatcherConfig, ConfigError, ConvertError,
    InvariantViolation, ItemResult, PermitPolicy, SealedBatch,
};

use crate::coalescer::Coalescer;
use crate::metrics::{BatcherMetrics, MetricsSnapshot};

type Completion<V> = oneshot::Sender<Result<V, BatchError>>;

enum BatchOutcome<K, V> {
    Converted(Vec<ItemResult<K, V>>),
    Failed(Arc<anyhow::Error>),
    Cancelled,
}

/// Handle to the eventual result of one submitted item.
///
/// Resolves exactly once. Dropping it does not withdraw the item; the batch
/// still runs and the result is discarded.
#[must_use = "a pending result does nothing unless awaited"]
#[derive(Debug)]
pub struct PendingResult<V> {
    batch: BatchId,
    rx: oneshot::Receiver<Result<V, BatchError>>,
}

impl<V> PendingResult<V> {
    /// The batch the item was assigned to at registration.
    pub fn batch_id(&self) -> BatchId {
        self.batch
    }
}

impl<V> Future for PendingResult<V> {
    type Output = Result<V, BatchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let batch = this.batch;
        // A completion dropped unresolved means the processor went away.
        this.rx
            .poll_unpin(cx)
            .map(|received| received.unwrap_or_else(|_| Err(BatchError::Cancelled { batch })))
    }
}

struct Shared<C: BatchConverter> {
    converter: Arc<C>,
    pending: DashMap<C::Item, Completion<C::Output>>,
    membership: DashMap<BatchId, Vec<C::Item>>,
    in_flight: DashMap<BatchId, AbortHandle>,
    permits: Arc<Semaphore>,
    permit_policy: PermitPolicy,
    outstanding: watch::Sender<usize>,
    metrics: BatcherMetrics,
}

impl<C: BatchConverter> Shared<C> {
    fn new(converter: Arc<C>, config: &BatcherConfig) -> Self {
        let (outstanding, _) = watch::channel(0usize);
        Self {
            converter,
            pending: DashMap::new(),
            membership: DashMap::new(),
            in_flight: DashMap::new(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_dispatches)),
            permit_policy: config.permit_policy,
            outstanding,
            metrics: BatcherMetrics::default(),
        }
    }

    /// Runs synchronously inside the coalescer's listener, before the batch
    /// is queued, so membership is complete before any dispatch.
    fn on_sealed(&self, batch: &SealedBatch<C::Item>) {
        self.membership.insert(batch.id, batch.items.clone());
        self.outstanding.send_modify(|n| *n += 1);
        self.metrics.record_sealed(batch.trigger);
    }

    async fn execute(self: Arc<Self>, batch: SealedBatch<C::Item>, permit: OwnedSemaphorePermit) {
        let SealedBatch { id, items, .. } = batch;
        let size = items.len();

        let converter = Arc::clone(&self.converter);
        let call = tokio::spawn(async move { converter.convert_batch(items).await });
        self.in_flight.insert(id, call.abort_handle());

        let held = match self.permit_policy {
            PermitPolicy::UntilComplete => Some(permit),
            PermitPolicy::UntilDispatched => {
                drop(permit);
                None
            }
        };
        debug!(batch = %id, size, worker = self.converter.name(), "worker call issued");

        let outcome = match call.await {
            Ok(Ok(results)) => BatchOutcome::Converted(results),
            Ok(Err(ConvertError::Failed(error))) => BatchOutcome::Failed(error),
            Ok(Err(ConvertError::Cancelled)) => BatchOutcome::Cancelled,
            Err(join) if join.is_cancelled() => BatchOutcome::Cancelled,
            Err(join) => BatchOutcome::Failed(Arc::new(anyhow::anyhow!(
                "worker '{}' panicked: {join}",
                self.converter.name()
            ))),
        };

        self.in_flight.remove(&id);
        self.resolve(id, outcome);
        drop(held);
    }

    /// Resolve every member of `batch` and drop its bookkeeping.
    fn resolve(&self, batch: BatchId, outcome: BatchOutcome<C::Item, C::Output>) {
        let Some((_, members)) = self.membership.remove(&batch) else {
            self.violation(&InvariantViolation::MissingMembership { batch });
            // Still counted as outstanding; shutdown must not wait on it forever.
            self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
            return;
        };

        // Members resolved (or found missing) by this call.
        let mut handled = HashSet::with_capacity(members.len());

        match outcome {
            BatchOutcome::Converted(results) => {
                self.demux(batch, &members, results, &mut handled);
            }
            BatchOutcome::Failed(error) => {
                warn!(%batch, size = members.len(), %error, "worker call failed");
                self.metrics.record_batch_failed();
                for item in &members {
                    handled.insert(item.clone());
                    let failure = BatchError::WorkerFailed {
                        batch,
                        error: Arc::clone(&error),
                    };
                    self.complete(batch, item, Err(failure));
                }
            }
            BatchOutcome::Cancelled => {
                warn!(%batch, size = members.len(), "worker call cancelled");
                self.metrics.record_batch_cancelled();
                for item in &members {
                    handled.insert(item.clone());
                    self.complete(batch, item, Err(BatchError::Cancelled { batch }));
                }
            }
        }

        // Terminal-state check. Anything left is still pending from this batch:
        // a member cannot be resubmitted while its first completion is live.
        for item in members.iter().filter(|item| !handled.contains(*item)) {
            let violation = InvariantViolation::UnresolvedCompletion {
                batch,
                item: format!("{item:?}"),
            };
            self.violation(&violation);
            self.complete(batch, item, Err(BatchError::Invariant(violation)));
        }

        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn demux(
        &self,
        batch: BatchId,
        members: &[C::Item],
        results: Vec<ItemResult<C::Item, C::Output>>,
        handled: &mut HashSet<C::Item>,
    ) {
        if results.len() != members.len() {
            let violation = InvariantViolation::ResultCountMismatch {
                batch,
                expected: members.len(),
                actual: results.len(),
            };
            self.violation(&violation);
            for item in members {
                handled.insert(item.clone());
                self.complete(batch, item, Err(BatchError::Invariant(violation.clone())));
            }
            return;
        }

        let member_set: HashSet<&C::Item> = members.iter().collect();
        let mut clean = true;
        for result in results {
            let (item, outcome) = result.into_parts();
            if !member_set.contains(&item) {
                // May belong to another in-flight batch; never route it.
                self.violation(&InvariantViolation::UnknownResultItem {
                    batch,
                    item: format!("{item:?}"),
                });
                clean = false;
                continue;
            }
            if !handled.insert(item.clone()) {
                self.violation(&InvariantViolation::DuplicateResult {
                    batch,
                    item: format!("{item:?}"),
                });
                clean = false;
                continue;
            }
            self.metrics.record_item(outcome.is_ok());
            self.complete(batch, &item, outcome.map_err(BatchError::Item));
        }
        // A response that broke the contract is counted only as violations.
        if clean {
            self.metrics.record_batch_succeeded();
        }
    }

    fn complete(&self, batch: BatchId, item: &C::Item, outcome: Result<C::Output, BatchError>) {
        match self.pending.remove(item) {
            Some((_, completion)) => {
                if completion.send(outcome).is_err() {
                    trace!(%batch, ?item, "caller dropped its handle before resolution");
                }
            }
            None => self.violation(&InvariantViolation::MissingCompletion {
                batch,
                item: format!("{item:?}"),
            }),
        }
    }

    fn violation(&self, violation: &InvariantViolation) {
        error!(batch = %violation.batch(), %violation, "batch invariant violated");
        self.metrics.record_violation();
    }
}

async fn dispatch_loop<C: BatchConverter>(
    shared: Arc<Shared<C>>,
    mut sealed: mpsc::UnboundedReceiver<SealedBatch<C::Item>>,
) {
    while let Some(batch) = sealed.recv().await {
        // Backpressure: the loop parks here while the pool is exhausted.
        let permit = match Arc::clone(&shared.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(batch = %batch.id, "permit pool closed, cancelling batch");
                shared.resolve(batch.id, BatchOutcome::Cancelled);
                continue;
            }
        };
        trace!(batch = %batch.id, "dispatch permit acquired");
        tokio::spawn(Arc::clone(&shared).execute(batch, permit));
    }
    debug!("dispatch loop stopped");
}

/// Request-coalescing batch processor.
///
/// # Usage
/// ```no_run
/// # use chainbatch_core::{BatchConverter, BatcherConfig};
/// # use chainbatch_engine::BatchProcessor;
/// # async fn example<C: BatchConverter<Item = u64>>(worker: C) -> Result<(), Box<dyn std::error::Error>> {
/// let processor = BatchProcessor::new(worker, BatcherConfig::default())?;
/// let hex = processor.call(42).await?;
/// # let _ = hex;
/// # Ok(())
/// # }
/// ```
///
/// # Panics
/// Construction spawns the dispatch loop and must happen inside a Tokio runtime.
pub struct BatchProcessor<C: BatchConverter> {
    config: BatcherConfig,
    coalescer: Arc<Coalescer<C::Item>>,
    shared: Arc<Shared<C>>,
    closed: AtomicBool,
}

impl<C: BatchConverter> BatchProcessor<C> {
    pub fn new(converter: C, config: BatcherConfig) -> Result<Self, ConfigError> {
        Self::with_converter(Arc::new(converter), config)
    }

    /// Build a processor around a worker shared with other owners.
    pub fn with_converter(converter: Arc<C>, config: BatcherConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let shared = Arc::new(Shared::new(converter, &config));

        let (tx, rx) = mpsc::unbounded_channel();
        let coalescer = Coalescer::from_config(&config);
        let listener = Arc::clone(&shared);
        coalescer.subscribe(move |batch: SealedBatch<C::Item>| {
            listener.on_sealed(&batch);
            if let Err(mpsc::error::SendError(batch)) = tx.send(batch) {
                warn!(batch = %batch.id, "dispatch loop is gone, cancelling batch");
                listener.resolve(batch.id, BatchOutcome::Cancelled);
            }
        });
        tokio::spawn(dispatch_loop(Arc::clone(&shared), rx));

        info!(
            max_batch_size = config.max_batch_size,
            max_batch_wait_ms = config.max_batch_wait_ms,
            max_concurrent_dispatches = config.max_concurrent_dispatches,
            permit_policy = %config.permit_policy,
            worker = shared.converter.name(),
            "batch processor started"
        );

        Ok(Self {
            config,
            coalescer,
            shared,
            closed: AtomicBool::new(false),
        })
    }

    /// Submit one item and get a handle to its result.
    ///
    /// Fails immediately, touching no state, if the item is already pending.
    pub fn submit(&self, item: C::Item) -> Result<PendingResult<C::Output>, BatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BatchError::Closed);
        }

        let (completion, rx) = oneshot::channel();
        match self.shared.pending.entry(item.clone()) {
            Entry::Occupied(_) => {
                self.shared.metrics.record_duplicate();
                return Err(BatchError::DuplicateItem {
                    item: format!("{item:?}"),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(completion);
            }
        }
        self.shared.metrics.record_submitted();

        let batch = self.coalescer.register(item);
        Ok(PendingResult { batch, rx })
    }

    /// Submit one item and wait for its result.
    pub async fn call(&self, item: C::Item) -> Result<C::Output, BatchError> {
        self.submit(item)?.await
    }

    /// Seal the open batch now instead of waiting for the count or timer.
    pub fn flush(&self) -> Option<BatchId> {
        self.coalescer.flush()
    }

    /// Abort every worker call currently executing. Members of those batches
    /// resolve as cancelled. Batches still waiting for a permit are unaffected.
    pub fn cancel_in_flight(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.shared.in_flight.iter() {
            entry.value().abort();
            cancelled += 1;
        }
        if cancelled > 0 {
            warn!(batches = cancelled, "cancelling in-flight worker calls");
        }
        cancelled
    }

    /// Stop accepting items, flush the open batch and wait until every sealed
    /// batch has been resolved.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("shutdown already requested");
        }
        info!(pending = self.pending_items(), "batch processor shutting down");
        self.coalescer.flush();

        let mut outstanding = self.shared.outstanding.subscribe();
        if outstanding.wait_for(|n| *n == 0).await.is_err() {
            warn!("outstanding batch counter closed during shutdown");
        }
        info!("batch processor drained");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Items submitted and not yet resolved.
    pub fn pending_items(&self) -> usize {
        self.shared.pending.len()
    }

    /// Sealed batches not yet resolved (queued or executing).
    pub fn outstanding_batches(&self) -> usize {
        *self.shared.outstanding.borrow()
    }

    /// Worker calls currently executing.
    pub fn in_flight_calls(&self) -> usize {
        self.shared.in_flight.len()
    }

    /// The coalescer feeding this processor. Extra listeners may subscribe to it.
    pub fn coalescer(&self) -> &Arc<Coalescer<C::Item>> {
        &self.coalescer
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }
}

impl<C: BatchConverter> std::fmt::Debug for BatchProcessor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("worker", &self.shared.converter.name())
            .field("pending_items", &self.pending_items())
            .field("outstanding_batches", &self.outstanding_batches())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Identity;

    #[async_trait]
    impl BatchConverter for Identity {
        type Item = u64;
        type Output = u64;

        async fn convert_batch(
            &self,
            items: Vec<u64>,
        ) -> Result<Vec<ItemResult<u64, u64>>, ConvertError> {
            Ok(items.into_iter().map(|i| ItemResult::success(i, i)).collect())
        }
    }

    #[test]
    fn unknown_batch_still_releases_outstanding_count() {
        let shared = Shared::new(Arc::new(Identity), &BatcherConfig::default());
        shared.outstanding.send_modify(|n| *n += 1);

        shared.resolve(BatchId::new(), BatchOutcome::Cancelled);

        assert_eq!(*shared.outstanding.borrow(), 0);
        let metrics = shared.metrics.snapshot();
        assert_eq!(metrics.invariant_violations, 1);
        assert_eq!(metrics.batches_cancelled, 0);
    }

    #[tokio::test]
    async fn dropped_completion_reads_as_cancelled() {
        let (tx, rx) = oneshot::channel::<Result<u64, BatchError>>();
        let batch = BatchId::new();
        let pending = PendingResult { batch, rx };
        assert_eq!(pending.batch_id(), batch);
        drop(tx);

        match pending.await {
            Err(BatchError::Cancelled { batch: b }) => assert_eq!(b, batch),
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delivered_completion_passes_through() {
        let (tx, rx) = oneshot::channel();
        let pending = PendingResult {
            batch: BatchId::new(),
            rx,
        };
        tx.send(Ok::<_, BatchError>("2A".to_string())).unwrap();
        assert_eq!(pending.await.unwrap(), "2A");
    }
}
