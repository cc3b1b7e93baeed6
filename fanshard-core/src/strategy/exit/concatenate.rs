use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{ExitOperationsCollector, ExitStrategy, require_shard};
use crate::error::ShardResult;
use crate::shard::ShardRef;

/// Appends every non-null shard list, in merge order.
pub struct ConcatenateListsExitStrategy<E> {
    results: Mutex<Vec<E>>,
}

impl<E> ConcatenateListsExitStrategy<E> {
    pub fn new() -> Self {
        Self {
            results: Mutex::new(Vec::new()),
        }
    }

    fn results(&self) -> MutexGuard<'_, Vec<E>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E> Default for ConcatenateListsExitStrategy<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Send> ExitStrategy<Vec<E>> for ConcatenateListsExitStrategy<E> {
    type Output = Vec<E>;

    fn add_result(
        &self,
        result: Option<Vec<E>>,
        shard: Option<&ShardRef>,
    ) -> ShardResult<bool> {
        require_shard(shard)?;
        if let Some(list) = result {
            self.results().extend(list);
        }
        Ok(false)
    }

    fn compile_results(
        &self,
        collector: Option<&dyn ExitOperationsCollector<Vec<E>>>,
    ) -> ShardResult<Vec<E>> {
        let results = std::mem::take(&mut *self.results());
        match collector {
            Some(collector) => collector.apply(results),
            None => Ok(results),
        }
    }
}
