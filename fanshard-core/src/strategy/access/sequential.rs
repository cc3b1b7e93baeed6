use std::sync::Arc;

use super::{ShardOrdering, feed, require_shards};
use crate::error::{ShardError, ShardFailure, ShardResult};
use crate::operation::ShardOperation;
use crate::shard::ShardRef;
use crate::strategy::exit::{ExitOperationsCollector, ExitStrategy};

/// Runs the operation on one shard at a time, stopping as soon as the exit
/// strategy asks to.
#[derive(Debug, Default)]
pub struct SequentialShardAccessStrategy {
    ordering: ShardOrdering,
}

impl SequentialShardAccessStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ordering(mut self, ordering: ShardOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn ordering(&self) -> &ShardOrdering {
        &self.ordering
    }

    pub async fn apply<T, X>(
        &self,
        shards: &[ShardRef],
        operation: Arc<dyn ShardOperation<T>>,
        exit: &X,
        collector: Option<&dyn ExitOperationsCollector<X::Output>>,
    ) -> ShardResult<X::Output>
    where
        T: Send + 'static,
        X: ExitStrategy<T>,
    {
        require_shards(shards)?;
        let name = operation.operation_name();
        let mut completed = Vec::new();
        for shard in self.ordering.order(shards)? {
            let result = match operation.execute(&shard).await {
                Ok(result) => result,
                Err(source) => {
                    return Err(ShardError::OperationFailure {
                        operation: name.to_string(),
                        failures: vec![ShardFailure::new(
                            shard.physical_id(),
                            source,
                        )],
                        completed,
                    });
                }
            };
            completed.push(shard.physical_id());
            if feed(exit, result, &shard, name)? {
                break;
            }
        }
        exit.compile_results(collector)
    }
}
