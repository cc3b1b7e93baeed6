use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{CompletionStatus, SetupTransactionOpenSessionEvent, Synchronization};
use crate::error::{BoxError, ShardError, ShardFailure, ShardResult};
use crate::shard::{NativeTransaction, ShardId, ShardRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Created,
    Active,
    Committed,
    FailedCommit,
    RolledBack,
}

struct ManagedTransaction {
    shard: ShardId,
    native: Arc<dyn NativeTransaction>,
}

/// One logical transaction over the native transactions of a session's
/// shards.
///
/// Shards whose session is already open are enlisted at creation. The others
/// enlist when their session opens; if the logical transaction is active by
/// then, their native transaction is begun on the spot.
///
/// Commit is not atomic. Native transactions commit one after the other and
/// a failure part way leaves the earlier ones committed; the caller learns
/// which from [`ShardError::CommitFailure`] and may still roll back the rest.
pub struct ShardedTransaction {
    transactions: tokio::sync::Mutex<Vec<ManagedTransaction>>,
    status: RwLock<TransactionStatus>,
    timeout: Mutex<Option<u32>>,
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,
}

impl fmt::Debug for ShardedTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedTransaction")
            .field("status", &self.status)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ShardedTransaction {
    pub async fn new(shards: &[ShardRef]) -> Arc<Self> {
        let transaction = Arc::new(Self {
            transactions: tokio::sync::Mutex::new(Vec::new()),
            status: RwLock::new(TransactionStatus::Created),
            timeout: Mutex::new(None),
            synchronizations: Mutex::new(Vec::new()),
        });
        let event = Arc::new(SetupTransactionOpenSessionEvent::new(
            Arc::downgrade(&transaction),
        ));
        {
            let mut transactions = transaction.transactions.lock().await;
            for shard in shards {
                if let Some(session) =
                    shard.register_open_session_event(event.clone())
                {
                    transactions.push(ManagedTransaction {
                        shard: shard.physical_id(),
                        native: session.transaction(),
                    });
                }
            }
        }
        transaction
    }

    pub fn status(&self) -> TransactionStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while the transaction is active or still needs a rollback after
    /// a failed commit.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status(),
            TransactionStatus::Active | TransactionStatus::FailedCommit
        )
    }

    pub fn timeout(&self) -> Option<u32> {
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shards whose native transaction is enlisted, in enlistment order.
    pub async fn enlisted_shards(&self) -> Vec<ShardId> {
        self.transactions
            .lock()
            .await
            .iter()
            .map(|managed| managed.shard)
            .collect()
    }

    pub async fn set_timeout(&self, seconds: u32) {
        let transactions = self.transactions.lock().await;
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(seconds);
        for managed in transactions.iter() {
            managed.native.set_timeout(seconds);
        }
    }

    pub fn register_synchronization(
        &self,
        synchronization: Option<Arc<dyn Synchronization>>,
    ) -> ShardResult<()> {
        let synchronization = synchronization.ok_or_else(|| {
            ShardError::invalid_argument("null synchronization")
        })?;
        self.synchronizations().push(synchronization);
        Ok(())
    }

    /// Begin every enlisted native transaction.
    ///
    /// Beginning an active transaction does nothing. When any native begin
    /// fails, the ones that did begin are rolled back and the transaction
    /// stays [`TransactionStatus::Created`].
    pub async fn begin(&self) -> ShardResult<()> {
        let transactions = self.transactions.lock().await;
        match self.status() {
            TransactionStatus::Created => {}
            TransactionStatus::Active => {
                debug!("transaction already active, ignoring begin");
                return Ok(());
            }
            status => {
                return Err(ShardError::transaction(format!(
                    "cannot begin a transaction in state {:?}",
                    status
                )));
            }
        }

        let timeout = self.timeout();
        let mut failed = Vec::new();
        let mut first_error: Option<BoxError> = None;
        for managed in transactions.iter() {
            if let Some(seconds) = timeout {
                managed.native.set_timeout(seconds);
            }
            if let Err(source) = managed.native.begin().await {
                warn!(
                    "exception starting transaction on shard {}: {}",
                    managed.shard, source
                );
                failed.push(managed.shard);
                if first_error.is_none() {
                    first_error = Some(source);
                }
            }
        }

        if !failed.is_empty() {
            for managed in transactions.iter() {
                if !managed.native.is_active() {
                    continue;
                }
                if let Err(e) = managed.native.rollback().await {
                    warn!(
                        "compensating rollback failed on shard {}: {}",
                        managed.shard, e
                    );
                }
            }
            return Err(ShardError::BeginFailure {
                failed,
                source: first_error,
            });
        }

        self.set_status(TransactionStatus::Active);
        info!("began transaction on {} shard(s)", transactions.len());
        Ok(())
    }

    /// Commit every enlisted native transaction in enlistment order.
    ///
    /// Stops at the first native failure without undoing earlier commits.
    pub async fn commit(&self) -> ShardResult<()> {
        let transactions = self.transactions.lock().await;
        let status = self.status();
        if status != TransactionStatus::Active {
            return Err(ShardError::transaction(format!(
                "cannot commit a transaction in state {:?}",
                status
            )));
        }

        self.notify("before_completion", |sync| sync.before_completion());

        let mut committed = Vec::new();
        let mut failure = None;
        for managed in transactions.iter() {
            match managed.native.commit().await {
                Ok(()) => committed.push(managed.shard),
                Err(source) => {
                    error!(
                        "commit failed on shard {} after committing {:?}: {}",
                        managed.shard, committed, source
                    );
                    failure = Some((managed.shard, source));
                    break;
                }
            }
        }

        let (outcome, completion) = match failure {
            None => {
                self.set_status(TransactionStatus::Committed);
                info!("committed transaction on {} shard(s)", committed.len());
                (Ok(()), CompletionStatus::Committed)
            }
            Some((shard, source)) => {
                self.set_status(TransactionStatus::FailedCommit);
                let err = ShardError::CommitFailure {
                    shard,
                    committed,
                    source,
                };
                (Err(err), CompletionStatus::Unknown)
            }
        };
        drop(transactions);
        self.notify("after_completion", |sync| {
            sync.after_completion(completion)
        });
        outcome
    }

    /// Roll back every enlisted native transaction that has not committed.
    ///
    /// Native failures do not stop the loop; they are reported together and
    /// leave the status unchanged so the rollback can be retried.
    pub async fn rollback(&self) -> ShardResult<()> {
        let transactions = self.transactions.lock().await;
        let status = self.status();
        if !matches!(
            status,
            TransactionStatus::Active | TransactionStatus::FailedCommit
        ) {
            return Err(ShardError::transaction(format!(
                "cannot roll back a transaction in state {:?}",
                status
            )));
        }

        let mut failures = Vec::new();
        for managed in transactions.iter() {
            if managed.native.was_committed() {
                debug!(
                    "skipping rollback of committed transaction on shard {}",
                    managed.shard
                );
                continue;
            }
            if let Err(source) = managed.native.rollback().await {
                warn!("rollback failed on shard {}: {}", managed.shard, source);
                failures.push(ShardFailure::new(managed.shard, source));
            }
        }

        let (outcome, completion) = if failures.is_empty() {
            self.set_status(TransactionStatus::RolledBack);
            info!("rolled back transaction");
            (Ok(()), CompletionStatus::RolledBack)
        } else {
            (
                Err(ShardError::RollbackFailure { failures }),
                CompletionStatus::Unknown,
            )
        };
        drop(transactions);
        self.notify("after_completion", |sync| {
            sync.after_completion(completion)
        });
        outcome
    }

    /// Enlist the native transaction of a shard whose session just opened.
    ///
    /// A late begin failure is returned to the shard, which then discards
    /// the session; the next open retries the enlistment.
    pub(crate) async fn setup_transaction(
        &self,
        shard: ShardId,
        native: Arc<dyn NativeTransaction>,
    ) -> ShardResult<()> {
        let mut transactions = self.transactions.lock().await;
        if transactions.iter().any(|m| Arc::ptr_eq(&m.native, &native)) {
            return Ok(());
        }
        debug!("setting up transaction on shard {}", shard);
        if let Some(seconds) = self.timeout() {
            native.set_timeout(seconds);
        }
        if self.status() == TransactionStatus::Active {
            if let Err(source) = native.begin().await {
                warn!(
                    "exception starting late transaction on shard {}: {}",
                    shard, source
                );
                // the shard refuses the session, so nothing is enlisted
                if native.is_active() {
                    if let Err(e) = native.rollback().await {
                        warn!("rollback failed on shard {}: {}", shard, e);
                    }
                }
                return Err(ShardError::BeginFailure {
                    failed: vec![shard],
                    source: Some(source),
                });
            }
        }
        transactions.push(ManagedTransaction { shard, native });
        Ok(())
    }

    fn set_status(&self, status: TransactionStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    fn synchronizations(&self) -> MutexGuard<'_, Vec<Arc<dyn Synchronization>>> {
        self.synchronizations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify<F>(&self, stage: &str, callback: F)
    where
        F: Fn(&dyn Synchronization) -> Result<(), BoxError>,
    {
        let synchronizations = self.synchronizations().clone();
        for sync in synchronizations {
            match catch_unwind(AssertUnwindSafe(|| callback(sync.as_ref()))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    "exception calling user Synchronization {}: {}",
                    stage, e
                ),
                Err(_) => warn!("user Synchronization panicked in {}", stage),
            }
        }
    }
}
