use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{ExitOperationsCollector, ExitStrategy, require_shard};
use crate::error::ShardResult;
use crate::shard::ShardRef;

struct Found<T> {
    result: Option<T>,
    shard: Option<ShardRef>,
}

/// Keeps the first non-null result and the shard that produced it.
///
/// Stops dispatch as soon as a value is found. Which shard wins depends on
/// the merge order of the access strategy, so pair it with sequential
/// dispatch or with shard-ordered concurrent merging.
pub struct FirstNonNullResultExitStrategy<T> {
    found: Mutex<Found<T>>,
}

impl<T> FirstNonNullResultExitStrategy<T> {
    pub fn new() -> Self {
        Self {
            found: Mutex::new(Found {
                result: None,
                shard: None,
            }),
        }
    }

    /// Shard that produced the winning result, if any.
    pub fn shard_of_result(&self) -> Option<ShardRef> {
        self.found().shard.clone()
    }

    fn found(&self) -> MutexGuard<'_, Found<T>> {
        self.found.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for FirstNonNullResultExitStrategy<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ExitStrategy<T> for FirstNonNullResultExitStrategy<T>
where
    T: Clone + Send,
{
    type Output = Option<T>;

    fn add_result(
        &self,
        result: Option<T>,
        shard: Option<&ShardRef>,
    ) -> ShardResult<bool> {
        let shard = require_shard(shard)?;
        let mut found = self.found();
        if found.result.is_none() && result.is_some() {
            found.result = result;
            found.shard = Some(shard.clone());
        }
        Ok(found.result.is_some())
    }

    fn compile_results(
        &self,
        collector: Option<&dyn ExitOperationsCollector<Option<T>>>,
    ) -> ShardResult<Option<T>> {
        let result = self.found().result.clone();
        match collector {
            Some(collector) => collector.apply(result),
            None => Ok(result),
        }
    }
}
