//! Shard fan-out execution engine: dispatch one operation across many
//! backend partitions, merge the per-shard results, and coordinate a logical
//! transaction over the partitions a unit of work touched.

pub mod config;
pub mod error;
pub mod memory;
pub mod operation;
pub mod session;
pub mod shard;
pub mod strategy;
pub mod transaction;

pub use config::{
    AccessStrategyKind, FanshardConfig, OrderingKind, VirtualShardMap,
};
pub use error::{BoxError, ShardError, ShardFailure, ShardResult};
pub use operation::{FnShardOperation, ShardOperation, operation};
pub use session::{
    ShardedSession, ShardedSessionFactory, ShardedSessionFactoryBuilder,
};
pub use shard::{
    NativeSession, NativeSessionFactory, NativeTransaction, OpenSessionEvent,
    Shard, ShardId, ShardRef,
};
pub use strategy::access::{
    MergeOrder, ParallelShardAccessStrategy, SequentialShardAccessStrategy,
    ShardAccessStrategy, ShardOrdering,
};
pub use strategy::exit::{
    AggregateExitStrategy, AggregateFunction, Aggregatable,
    ConcatenateListsExitStrategy, ExitOperationsCollector, ExitStrategy,
    FirstNonNullResultExitStrategy, Order, PropertyAccessors,
    ResultListCollector, SortDirection, SortValue,
};
pub use transaction::{
    CompletionStatus, ShardedTransaction, Synchronization, TransactionStatus,
};
