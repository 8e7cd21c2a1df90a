//! `chainbatch run`: push a burst of integers through the batcher.
//!
//! Items `1..=N` are submitted at once, every handle is awaited, and one line
//! per item is printed in submission order:
//! ```text
//! 9: 09
//! 10: Error message: item failed: Error occurred at 10.
//! ```

use std::time::Instant;

use anyhow::{Context, Result};
use chainbatch_core::BatcherConfig;
use chainbatch_engine::{BatchProcessor, MetricsSnapshot};
use futures::future::join_all;
use serde::Serialize;
use tracing::info;

use crate::hex::HexConverter;

#[derive(Debug, Serialize)]
struct ItemReport {
    item: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ItemReport {
    fn line(&self) -> String {
        match (&self.result, &self.error) {
            (Some(hex), _) => format!("{}: {}", self.item, hex),
            (None, Some(err)) => format!("{}: Error message: {}", self.item, err),
            (None, None) => format!("{}: <unresolved>", self.item),
        }
    }
}

#[derive(Debug, Serialize)]
struct RunReport {
    config: BatcherConfig,
    elapsed_ms: u128,
    items: Vec<ItemReport>,
    metrics: MetricsSnapshot,
}

pub async fn run(
    config: BatcherConfig,
    items: u64,
    worker: HexConverter,
    json: bool,
) -> Result<()> {
    let processor = BatchProcessor::new(worker, config.clone())
        .context("invalid batcher configuration")?;

    let started = Instant::now();
    let mut handles = Vec::with_capacity(items as usize);
    for item in 1..=items {
        let handle = processor
            .submit(item)
            .with_context(|| format!("submitting item {item}"))?;
        handles.push(handle);
    }
    info!(items, "all items submitted");

    let outcomes = join_all(handles).await;
    processor.shutdown().await;

    let report = RunReport {
        config,
        elapsed_ms: started.elapsed().as_millis(),
        items: (1..=items)
            .zip(outcomes)
            .map(|(item, outcome)| match outcome {
                Ok(hex) => ItemReport {
                    item,
                    result: Some(hex),
                    error: None,
                },
                Err(err) => ItemReport {
                    item,
                    result: None,
                    error: Some(err.to_string()),
                },
            })
            .collect(),
        metrics: processor.metrics(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text(&report);
    }
    Ok(())
}

fn print_text(report: &RunReport) {
    for item in &report.items {
        println!("{}", item.line());
    }
    let m = &report.metrics;
    println!();
    println!("Batches:");
    println!(
        "  Sealed:     {} (count {}, timer {}, flush {})",
        m.batches_sealed(),
        m.batches_sealed_by_count,
        m.batches_sealed_by_timer,
        m.batches_sealed_by_flush
    );
    println!("  Succeeded:  {}", m.batches_succeeded);
    println!("  Failed:     {}", m.batches_failed);
    println!("  Cancelled:  {}", m.batches_cancelled);
    println!("Items:");
    println!("  Submitted:  {}", m.items_submitted);
    println!("  Succeeded:  {}", m.items_succeeded);
    println!("  Failed:     {}", m.items_failed);
    if m.invariant_violations > 0 {
        println!("  Violations: {}", m.invariant_violations);
    }
    println!("Duration:     {}ms", report.elapsed_ms);
}
