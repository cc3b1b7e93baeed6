//! Logical transaction spanning the native transactions of several shards.

mod event;
mod sharded;
mod sync;

pub use event::SetupTransactionOpenSessionEvent;
pub use sharded::{ShardedTransaction, TransactionStatus};
pub use sync::{CompletionStatus, Synchronization};
