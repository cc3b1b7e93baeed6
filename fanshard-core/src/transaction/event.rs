use std::sync::{Arc, Weak};

use async_trait::async_trait;

use super::ShardedTransaction;
use crate::error::ShardResult;
use crate::shard::{NativeSession, OpenSessionEvent, ShardId};

/// Enlists a shard's native transaction once its session opens.
pub struct SetupTransactionOpenSessionEvent {
    transaction: Weak<ShardedTransaction>,
}

impl SetupTransactionOpenSessionEvent {
    pub fn new(transaction: Weak<ShardedTransaction>) -> Self {
        Self { transaction }
    }
}

#[async_trait]
impl OpenSessionEvent for SetupTransactionOpenSessionEvent {
    async fn on_open_session(
        &self,
        shard: ShardId,
        session: &Arc<dyn NativeSession>,
    ) -> ShardResult<()> {
        // the logical transaction may be gone before the shard is touched
        match self.transaction.upgrade() {
            Some(transaction) => {
                transaction.setup_transaction(shard, session.transaction()).await
            }
            None => Ok(()),
        }
    }
}
