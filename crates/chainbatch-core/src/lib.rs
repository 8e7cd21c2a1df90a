//! chainbatch-core: foundation traits and types for ChainBatch.
//!
//! # Overview
//!
//! ChainBatch coalesces individually submitted work items into batches and
//! hands each batch to a batch-capable worker exactly once. The core crate
//! defines the pieces every other crate agrees on:
//!
//! - [`BatchConverter`]: the async trait a batch worker implements
//! - [`BatchId`] / [`SealedBatch`] / [`ItemResult`]: identifiers and wire types
//! - [`BatchError`] / [`ConvertError`] / [`InvariantViolation`]: error taxonomy
//! - [`BatcherConfig`]: count/time thresholds and the permit pool size
//!
//! The runtime pieces (timer, coalescer, dispatcher) live in
//! `chainbatch-engine`.

pub mod config;
pub mod converter;
pub mod error;
pub mod item;

pub use config::{BatcherConfig, PermitPolicy};
pub use converter::BatchConverter;
pub use error::{BatchError, ConfigError, ConvertError, InvariantViolation, ItemFailure};
pub use item::{BatchId, BatchItem, ItemResult, SealTrigger, SealedBatch};
