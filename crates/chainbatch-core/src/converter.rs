//! The `BatchConverter` trait: the contract every batch worker implements.

use async_trait::async_trait;

use crate::error::ConvertError;
use crate::item::{BatchItem, ItemResult};

/// A worker that converts a whole batch of items in one call.
///
/// # Contract
/// `items` is ordered and never empty. On success the worker returns exactly
/// one [`ItemResult`] per input item, in any order, each tagged with the item
/// it belongs to. A worker may instead fail or cancel the call as a whole with
/// [`ConvertError`]; the dispatcher fans that outcome out to every member of
/// the batch.
///
/// Returning the wrong number of results, or a result for an item that was
/// not in the batch, is a contract breach and is surfaced to the callers as an
/// invariant violation.
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; calls for different batches may run
/// concurrently up to the dispatcher's permit pool size.
#[async_trait]
pub trait BatchConverter: Send + Sync + 'static {
    /// Item identifier type.
    type Item: BatchItem;
    /// Payload produced for a successful item.
    type Output: Send + 'static;

    /// Convert one batch.
    async fn convert_batch(
        &self,
        items: Vec<Self::Item>,
    ) -> Result<Vec<ItemResult<Self::Item, Self::Output>>, ConvertError>;

    /// Human-readable worker name, used in logs.
    fn name(&self) -> &str {
        "converter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubler;

    #[async_trait]
    impl BatchConverter for Doubler {
        type Item = u64;
        type Output = u64;

        async fn convert_batch(
            &self,
            items: Vec<u64>,
        ) -> Result<Vec<ItemResult<u64, u64>>, ConvertError> {
            Ok(items
                .into_iter()
                .map(|i| ItemResult::success(i, i * 2))
                .collect())
        }
    }

    #[tokio::test]
    async fn default_name_and_call() {
        let worker = Doubler;
        assert_eq!(worker.name(), "converter");
        let results = worker.convert_batch(vec![1, 2]).await.unwrap();
        assert_eq!(
            results,
            vec![ItemResult::success(1, 2), ItemResult::success(2, 4)]
        );
    }
}
