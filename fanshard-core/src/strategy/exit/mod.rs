//! Merging of per-shard results into one logical result.

mod aggregate;
mod collector;
mod concatenate;
mod first_non_null;
mod sort;

pub use aggregate::{Aggregatable, AggregateExitStrategy, AggregateFunction};
pub use collector::{
    Order, PropertyAccessors, ResultListCollector, SortDirection,
};
pub use concatenate::ConcatenateListsExitStrategy;
pub use first_non_null::FirstNonNullResultExitStrategy;
pub use sort::SortValue;

use crate::error::{ShardError, ShardResult};
use crate::shard::ShardRef;

/// Accumulates per-shard results of one distributed call.
///
/// A strategy instance serves exactly one call: any number of
/// [`add_result`](ExitStrategy::add_result) followed by a single
/// [`compile_results`](ExitStrategy::compile_results), which may drain the
/// accumulated state. `add_result` may be called from several tasks at once.
pub trait ExitStrategy<T>: Send + Sync {
    type Output;

    /// Record the result of one shard. Returns `true` when no further shards
    /// need to be dispatched.
    fn add_result(
        &self,
        result: Option<T>,
        shard: Option<&ShardRef>,
    ) -> ShardResult<bool>;

    fn compile_results(
        &self,
        collector: Option<&dyn ExitOperationsCollector<Self::Output>>,
    ) -> ShardResult<Self::Output>;
}

/// Post-processing applied to a compiled result (ordering, paging, ...).
pub trait ExitOperationsCollector<R>: Send + Sync {
    fn apply(&self, results: R) -> ShardResult<R>;
}

pub(crate) fn require_shard(shard: Option<&ShardRef>) -> ShardResult<&ShardRef> {
    shard.ok_or_else(|| {
        ShardError::invalid_argument("shard is required to add a result")
    })
}
