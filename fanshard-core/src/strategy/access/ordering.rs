use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::seq::SliceRandom;

use crate::error::{ShardError, ShardResult};
use crate::shard::ShardRef;

pub type OrderingFn = Arc<dyn Fn(&[ShardRef]) -> Vec<ShardRef> + Send + Sync>;

/// Order in which an access strategy dispatches the shards of one call.
#[derive(Default)]
pub enum ShardOrdering {
    #[default]
    InputOrder,
    /// Rotates the first shard by one position on every call.
    RoundRobin(AtomicUsize),
    /// Fresh shuffle per call.
    Random,
    /// Caller supplied; must return a permutation of its input.
    Custom(OrderingFn),
}

impl ShardOrdering {
    pub fn round_robin() -> Self {
        ShardOrdering::RoundRobin(AtomicUsize::new(0))
    }

    pub fn custom<F>(func: F) -> Self
    where
        F: Fn(&[ShardRef]) -> Vec<ShardRef> + Send + Sync + 'static,
    {
        ShardOrdering::Custom(Arc::new(func))
    }

    /// Dispatch order for `shards`. A custom ordering that does not return a
    /// permutation of its input is an `InvalidArgument` error.
    pub fn order(&self, shards: &[ShardRef]) -> ShardResult<Vec<ShardRef>> {
        let mut ordered = shards.to_vec();
        match self {
            ShardOrdering::InputOrder => {}
            ShardOrdering::RoundRobin(next) => {
                if !ordered.is_empty() {
                    let start = next.fetch_add(1, Ordering::Relaxed);
                    ordered.rotate_left(start % shards.len());
                }
            }
            ShardOrdering::Random => ordered.shuffle(&mut rand::rng()),
            ShardOrdering::Custom(func) => {
                ordered = func(shards);
                if !is_permutation(shards, &ordered) {
                    return Err(ShardError::invalid_argument(format!(
                        "custom shard ordering returned {} shard(s) that are \
                         not a permutation of the {} given",
                        ordered.len(),
                        shards.len()
                    )));
                }
            }
        }
        Ok(ordered)
    }
}

fn is_permutation(input: &[ShardRef], ordered: &[ShardRef]) -> bool {
    if input.len() != ordered.len() {
        return false;
    }
    let mut taken = vec![false; input.len()];
    ordered.iter().all(|shard| {
        match input
            .iter()
            .enumerate()
            .position(|(i, s)| !taken[i] && Arc::ptr_eq(s, shard))
        {
            Some(i) => {
                taken[i] = true;
                true
            }
            None => false,
        }
    })
}

impl fmt::Debug for ShardOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardOrdering::InputOrder => write!(f, "InputOrder"),
            ShardOrdering::RoundRobin(next) => f
                .debug_tuple("RoundRobin")
                .field(&next.load(Ordering::Relaxed))
                .finish(),
            ShardOrdering::Random => write!(f, "Random"),
            ShardOrdering::Custom(_) => write!(f, "Custom"),
        }
    }
}
