//! `HexConverter`: the demo worker behind `chainbatch run`.
//!
//! Renders each integer as upper-case hex, zero-padded to two digits. Every
//! multiple of ten is reported as a per-item failure so the demo output shows
//! mixed results inside one batch.

use std::time::Duration;

use async_trait::async_trait;
use chainbatch_core::{BatchConverter, ConvertError, ItemResult};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct HexConverter {
    latency: Duration,
    fail_batches: bool,
}

impl HexConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated per-call latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail every call as a whole instead of converting.
    pub fn with_batch_failures(mut self, fail: bool) -> Self {
        self.fail_batches = fail;
        self
    }

    fn convert_one(n: u64) -> ItemResult<u64, String> {
        if n % 10 == 0 {
            ItemResult::failure(n, format!("Error occurred at {n}."))
        } else {
            ItemResult::success(n, format!("{n:02X}"))
        }
    }
}

#[async_trait]
impl BatchConverter for HexConverter {
    type Item = u64;
    type Output = String;

    async fn convert_batch(
        &self,
        items: Vec<u64>,
    ) -> Result<Vec<ItemResult<u64, String>>, ConvertError> {
        debug!(size = items.len(), first = ?items.first(), "hex batch received");
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail_batches {
            return Err(ConvertError::msg(format!(
                "hex service rejected a batch of {} items",
                items.len()
            )));
        }
        Ok(items.into_iter().map(Self::convert_one).collect())
    }

    fn name(&self) -> &str {
        "hex"
    }
}
