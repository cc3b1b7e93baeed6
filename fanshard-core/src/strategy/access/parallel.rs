use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{MergeOrder, ShardOrdering, feed, require_shards};
use crate::error::{BoxError, ShardError, ShardFailure, ShardResult};
use crate::operation::ShardOperation;
use crate::shard::{ShardId, ShardRef};
use crate::strategy::exit::{ExitOperationsCollector, ExitStrategy};

/// Runs the operation on every shard concurrently, one task per shard.
///
/// At most `max_concurrency` operations run at once (`0` means one per CPU).
/// Results travel over a channel to the calling task, which alone feeds the
/// exit strategy. Once the exit strategy stops the call, no new operation
/// starts; operations already running finish in the background and their
/// results are dropped. The first failure likewise keeps queued shards from
/// starting, and the call then waits for the running ones to settle before
/// reporting every failure.
#[derive(Debug, Default)]
pub struct ParallelShardAccessStrategy {
    ordering: ShardOrdering,
    max_concurrency: usize,
    merge_order: MergeOrder,
}

struct Branch<T> {
    index: usize,
    shard: ShardRef,
    outcome: Result<Option<T>, BoxError>,
}

impl ParallelShardAccessStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ordering(mut self, ordering: ShardOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_merge_order(mut self, merge_order: MergeOrder) -> Self {
        self.merge_order = merge_order;
        self
    }

    pub fn ordering(&self) -> &ShardOrdering {
        &self.ordering
    }

    pub fn merge_order(&self) -> MergeOrder {
        self.merge_order
    }

    /// Effective number of concurrently running operations.
    pub fn max_concurrency(&self) -> usize {
        if self.max_concurrency == 0 {
            num_cpus::get().max(1)
        } else {
            self.max_concurrency
        }
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
        let name = operation.operation_name().to_string();
        let token = CancellationToken::new();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency()));
        let (tx, rx) = flume::unbounded();
        let mut tasks = JoinSet::new();
        for (index, shard) in
            self.ordering.order(shards)?.into_iter().enumerate()
        {
            tasks.spawn(run_branch(
                index,
                shard,
                operation.clone(),
                token.clone(),
                semaphore.clone(),
                tx.clone(),
            ));
        }
        drop(tx);

        let mut merge = Merge::new(self.merge_order);
        let stopped = loop {
            let Ok(branch) = rx.recv_async().await else {
                break Ok(false);
            };
            match branch.outcome {
                Ok(result) => match merge.accept(
                    branch.index,
                    branch.shard,
                    result,
                    exit,
                    &name,
                ) {
                    Ok(false) => {}
                    stop_or_err => break stop_or_err,
                },
                Err(source) => {
                    warn!(
                        "Operation {} failed on shard {}: {}",
                        name, branch.shard, source
                    );
                    token.cancel();
                    let shard = branch.shard.physical_id();
                    merge.fail(branch.index, shard, source);
                }
            }
        };

        match stopped {
            Ok(false) => {
                while tasks.join_next().await.is_some() {}
                if let Some(err) = merge.into_error(name) {
                    return Err(err);
                }
            }
            Ok(true) => {
                token.cancel();
                let in_flight = tasks.len();
                tasks.detach_all();
                debug!(
                    "Discarding results of up to {} in-flight operations",
                    in_flight
                );
            }
            Err(err) => {
                token.cancel();
                tasks.detach_all();
                return Err(err);
            }
        }
        drop(rx);
        exit.compile_results(collector)
    }
}

async fn run_branch<T: Send + 'static>(
    index: usize,
    shard: ShardRef,
    operation: Arc<dyn ShardOperation<T>>,
    token: CancellationToken,
    semaphore: Arc<Semaphore>,
    tx: flume::Sender<Branch<T>>,
) {
    let _permit = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
    };
    if token.is_cancelled() {
        return;
    }
    let outcome = AssertUnwindSafe(operation.execute(&shard))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(panic_message(panic).into()));
    // receiver is gone once the call stopped; late results are dropped here
    let _ = tx.send(Branch {
        index,
        shard,
        outcome,
    });
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    };
    format!("operation panicked: {}", detail)
}

/// Merge bookkeeping of one parallel call.
struct Merge<T> {
    order: MergeOrder,
    pending: BTreeMap<usize, (ShardRef, Option<T>)>,
    next: usize,
    completed: Vec<(usize, ShardId)>,
    failures: Vec<(usize, ShardFailure)>,
}

impl<T> Merge<T> {
    fn new(order: MergeOrder) -> Self {
        Self {
            order,
            pending: BTreeMap::new(),
            next: 0,
            completed: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn accept<X>(
        &mut self,
        index: usize,
        shard: ShardRef,
        result: Option<T>,
        exit: &X,
        operation: &str,
    ) -> ShardResult<bool>
    where
        X: ExitStrategy<T>,
    {
        self.completed.push((index, shard.physical_id()));
        if !self.failures.is_empty() {
            return Ok(false);
        }
        match self.order {
            MergeOrder::Completion => feed(exit, result, &shard, operation),
            MergeOrder::ShardOrder => {
                self.pending.insert(index, (shard, result));
                while let Some((shard, result)) = self.pending.remove(&self.next)
                {
                    self.next += 1;
                    if feed(exit, result, &shard, operation)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn fail(&mut self, index: usize, shard: ShardId, source: BoxError) {
        self.failures.push((index, ShardFailure::new(shard, source)));
    }

    fn into_error(mut self, operation: String) -> Option<ShardError> {
        if self.failures.is_empty() {
            return None;
        }
        self.failures.sort_by_key(|(index, _)| *index);
        self.completed.sort_by_key(|(index, _)| *index);
        Some(ShardError::OperationFailure {
            operation,
            failures: self.failures.into_iter().map(|(_, f)| f).collect(),
            completed: self.completed.into_iter().map(|(_, id)| id).collect(),
        })
    }
}
