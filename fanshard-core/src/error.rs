use std::error::Error;
use std::fmt;

use crate::shard::ShardId;

pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

pub type ShardResult<T> = Result<T, ShardError>;

/// A failure raised by one shard during a fan-out.
#[derive(Debug)]
pub struct ShardFailure {
    pub shard: ShardId,
    pub source: BoxError,
}

impl ShardFailure {
    pub fn new(shard: ShardId, source: BoxError) -> Self {
        Self { shard, source }
    }
}

impl fmt::Display for ShardFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard {}: {}", self.shard, self.source)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ShardError {
    #[error("Invalid: {0}")]
    InvalidArgument(String),

    #[error("Begin failed on shards {failed:?}")]
    BeginFailure {
        failed: Vec<ShardId>,
        #[source]
        source: Option<BoxError>,
    },

    #[error(
        "Operation `{operation}` failed on {} shard(s) [{}]; completed on {completed:?}",
        .failures.len(),
        join_failures(.failures)
    )]
    OperationFailure {
        operation: String,
        failures: Vec<ShardFailure>,
        completed: Vec<ShardId>,
    },

    #[error(
        "Commit failed on shard {shard} (already committed: {committed:?}): {source}"
    )]
    CommitFailure {
        shard: ShardId,
        committed: Vec<ShardId>,
        source: BoxError,
    },

    #[error("Rollback failed [{}]", join_failures(.failures))]
    RollbackFailure { failures: Vec<ShardFailure> },

    #[error("Overflow: {0}")]
    Overflow(String),

    #[error("Unsupported: {0}")]
    UnsupportedCapability(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Session error on shard {shard}: {source}")]
    Session { shard: ShardId, source: BoxError },
}

impl ShardError {
    pub fn invalid_argument<T: ToString>(msg: T) -> Self {
        Self::InvalidArgument(msg.to_string())
    }

    pub fn overflow<T: ToString>(msg: T) -> Self {
        Self::Overflow(msg.to_string())
    }

    pub fn transaction<T: ToString>(msg: T) -> Self {
        Self::Transaction(msg.to_string())
    }

    pub fn configuration<T: ToString>(msg: T) -> Self {
        Self::Configuration(msg.to_string())
    }

    /// Shards that finished an operation before the fan-out was aborted.
    pub fn completed_shards(&self) -> &[ShardId] {
        match self {
            ShardError::OperationFailure { completed, .. } => completed,
            ShardError::CommitFailure { committed, .. } => committed,
            _ => &[],
        }
    }
}

fn join_failures(failures: &[ShardFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
