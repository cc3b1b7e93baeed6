//! Dispatch of one operation across a shard set.

mod ordering;
mod parallel;
mod sequential;

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use ordering::{OrderingFn, ShardOrdering};
pub use parallel::ParallelShardAccessStrategy;
pub use sequential::SequentialShardAccessStrategy;

use crate::error::{ShardError, ShardResult};
use crate::operation::ShardOperation;
use crate::shard::ShardRef;
use crate::strategy::exit::{ExitOperationsCollector, ExitStrategy};

/// How concurrently produced results are handed to the exit strategy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MergeOrder {
    /// Buffer results and merge them in dispatch order. The compiled result
    /// matches sequential dispatch.
    #[default]
    ShardOrder,
    /// Merge results as they complete. Order-sensitive exit strategies
    /// become nondeterministic.
    Completion,
}

impl FromStr for MergeOrder {
    type Err = ShardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shard" | "shard_order" => Ok(MergeOrder::ShardOrder),
            "completion" => Ok(MergeOrder::Completion),
            other => Err(ShardError::configuration(format!(
                "unknown merge order `{}`",
                other
            ))),
        }
    }
}

#[derive(Debug)]
pub enum ShardAccessStrategy {
    Sequential(SequentialShardAccessStrategy),
    Parallel(ParallelShardAccessStrategy),
}

impl Default for ShardAccessStrategy {
    fn default() -> Self {
        ShardAccessStrategy::Sequential(SequentialShardAccessStrategy::default())
    }
}

impl ShardAccessStrategy {
    /// Run `operation` on `shards`, feeding every result to `exit`, and
    /// return the compiled result.
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
        match self {
            ShardAccessStrategy::Sequential(strategy) => {
                strategy.apply(shards, operation, exit, collector).await
            }
            ShardAccessStrategy::Parallel(strategy) => {
                strategy.apply(shards, operation, exit, collector).await
            }
        }
    }
}

impl From<SequentialShardAccessStrategy> for ShardAccessStrategy {
    fn from(strategy: SequentialShardAccessStrategy) -> Self {
        ShardAccessStrategy::Sequential(strategy)
    }
}

impl From<ParallelShardAccessStrategy> for ShardAccessStrategy {
    fn from(strategy: ParallelShardAccessStrategy) -> Self {
        ShardAccessStrategy::Parallel(strategy)
    }
}

fn require_shards(shards: &[ShardRef]) -> ShardResult<()> {
    if shards.is_empty() {
        return Err(ShardError::invalid_argument(
            "cannot apply an operation to an empty shard set",
        ));
    }
    Ok(())
}

fn feed<T, X>(
    exit: &X,
    result: Option<T>,
    shard: &ShardRef,
    operation: &str,
) -> ShardResult<bool>
where
    X: ExitStrategy<T>,
{
    let stop = exit.add_result(result, Some(shard))?;
    if stop {
        debug!(
            "Short-circuiting operation {} after execution against shard {}",
            operation, shard
        );
    }
    Ok(stop)
}
