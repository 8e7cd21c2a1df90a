//! chainbatch-engine: the runtime half of ChainBatch.
//!
//! # Overview
//!
//! Callers submit items one at a time; the engine groups them into batches
//! and invokes a [`BatchConverter`](chainbatch_core::BatchConverter) once per
//! batch, then routes each item's result back to the caller that submitted it.
//!
//! - [`Countdown`]: restartable one-shot timer with stale-fire rejection
//! - [`BatchAccumulator`]: the open batch and its id
//! - [`Coalescer`]: seals batches by count or elapsed time
//! - [`BatchProcessor`]: bounded dispatch, demultiplexing and fan-out
//! - [`BatcherMetrics`]: counters for seals, outcomes and defects

pub mod accumulator;
pub mod coalescer;
pub mod metrics;
pub mod processor;
pub mod timer;

pub use accumulator::BatchAccumulator;
pub use coalescer::{BatchListener, Coalescer};
pub use metrics::{BatcherMetrics, MetricsSnapshot};
pub use processor::{BatchProcessor, PendingResult};
pub use timer::Countdown;

pub use chainbatch_core::{
    BatchConverter, BatchError, BatchId, BatchItem, BatcherConfig, ConvertError, ItemResult,
    PermitPolicy, SealTrigger, SealedBatch,
};
