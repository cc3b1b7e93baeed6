use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use crate::config::{FanshardConfig, VirtualShardMap};
use crate::error::{ShardError, ShardResult};
use crate::operation::ShardOperation;
use crate::shard::{NativeSessionFactory, Shard, ShardId, ShardRef};
use crate::strategy::access::ShardAccessStrategy;
use crate::strategy::exit::{ExitOperationsCollector, ExitStrategy};
use crate::transaction::{ShardedTransaction, TransactionStatus};

struct PhysicalShard {
    physical_id: ShardId,
    virtual_ids: BTreeSet<ShardId>,
    factory: Arc<dyn NativeSessionFactory>,
}

#[derive(Default)]
pub struct ShardedSessionFactoryBuilder {
    shards: Vec<(ShardId, Arc<dyn NativeSessionFactory>)>,
    virtual_shards: VirtualShardMap,
    access_strategy: Option<ShardAccessStrategy>,
    txn_timeout: Option<u32>,
}

impl ShardedSessionFactoryBuilder {
    /// Builder seeded with the strategy, timeout and virtual shard map of
    /// `config`; physical shards still have to be added.
    pub fn from_config(config: &FanshardConfig) -> Self {
        Self {
            shards: Vec::new(),
            virtual_shards: config.virtual_shards.clone().unwrap_or_default(),
            access_strategy: Some(config.build_access_strategy()),
            txn_timeout: config.txn_timeout_secs,
        }
    }

    pub fn add_shard<I: Into<ShardId>>(
        mut self,
        physical_id: I,
        factory: Arc<dyn NativeSessionFactory>,
    ) -> Self {
        self.shards.push((physical_id.into(), factory));
        self
    }

    pub fn virtual_shard_map(mut self, map: VirtualShardMap) -> Self {
        self.virtual_shards = map;
        self
    }

    pub fn access_strategy<S: Into<ShardAccessStrategy>>(
        mut self,
        strategy: S,
    ) -> Self {
        self.access_strategy = Some(strategy.into());
        self
    }

    pub fn transaction_timeout(mut self, seconds: u32) -> Self {
        self.txn_timeout = Some(seconds);
        self
    }

    pub fn build(self) -> ShardResult<ShardedSessionFactory> {
        if self.shards.is_empty() {
            return Err(ShardError::configuration(
                "at least one physical shard is required",
            ));
        }
        let mut seen = BTreeSet::new();
        for (physical_id, _) in &self.shards {
            if !seen.insert(*physical_id) {
                return Err(ShardError::configuration(format!(
                    "physical shard {} is registered twice",
                    physical_id
                )));
            }
        }

        let mut hosted = self.virtual_shards.inverse();
        for (virtual_id, physical_id) in self.virtual_shards.iter() {
            if !seen.contains(&physical_id) {
                return Err(ShardError::configuration(format!(
                    "virtual shard {} maps to unknown physical shard {}",
                    virtual_id, physical_id
                )));
            }
        }

        let mut shards = Vec::with_capacity(self.shards.len());
        for (physical_id, factory) in self.shards {
            let virtual_ids = if self.virtual_shards.is_empty() {
                BTreeSet::from([physical_id])
            } else {
                hosted.remove(&physical_id).ok_or_else(|| {
                    ShardError::configuration(format!(
                        "physical shard {} hosts no virtual shard",
                        physical_id
                    ))
                })?
            };
            shards.push(PhysicalShard {
                physical_id,
                virtual_ids,
                factory,
            });
        }

        Ok(ShardedSessionFactory {
            shards,
            access_strategy: Arc::new(self.access_strategy.unwrap_or_default()),
            txn_timeout: self.txn_timeout,
        })
    }
}

/// Source of [`ShardedSession`]s over a fixed set of physical shards.
pub struct ShardedSessionFactory {
    shards: Vec<PhysicalShard>,
    access_strategy: Arc<ShardAccessStrategy>,
    txn_timeout: Option<u32>,
}

impl ShardedSessionFactory {
    pub fn builder() -> ShardedSessionFactoryBuilder {
        ShardedSessionFactoryBuilder::default()
    }

    pub fn physical_shard_ids(&self) -> Vec<ShardId> {
        self.shards.iter().map(|s| s.physical_id).collect()
    }

    pub fn access_strategy(&self) -> &ShardAccessStrategy {
        &self.access_strategy
    }

    /// New session with one lazily opened handle per physical shard.
    pub fn open_session(&self) -> ShardResult<ShardedSession> {
        let mut shards = Vec::with_capacity(self.shards.len());
        let mut by_virtual = BTreeMap::new();
        for (index, physical) in self.shards.iter().enumerate() {
            let shard = Shard::new(
                physical.physical_id,
                physical.virtual_ids.iter().copied(),
                physical.factory.clone(),
            )?;
            for virtual_id in &physical.virtual_ids {
                by_virtual.insert(*virtual_id, index);
            }
            shards.push(Arc::new(shard));
        }
        Ok(ShardedSession {
            shards,
            by_virtual,
            access_strategy: self.access_strategy.clone(),
            txn_timeout: self.txn_timeout,
            transaction: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }
}

/// Logical session over every shard of a [`ShardedSessionFactory`].
pub struct ShardedSession {
    shards: Vec<ShardRef>,
    by_virtual: BTreeMap<ShardId, usize>,
    access_strategy: Arc<ShardAccessStrategy>,
    txn_timeout: Option<u32>,
    transaction: tokio::sync::Mutex<Option<Arc<ShardedTransaction>>>,
    closed: AtomicBool,
}

impl ShardedSession {
    pub fn shards(&self) -> &[ShardRef] {
        &self.shards
    }

    /// Distinct shard handles serving `shard_ids`, in first-seen order.
    pub fn shards_for(&self, shard_ids: &[ShardId]) -> ShardResult<Vec<ShardRef>> {
        let mut picked = BTreeSet::new();
        let mut shards = Vec::new();
        for shard_id in shard_ids {
            let index = self.by_virtual.get(shard_id).ok_or_else(|| {
                ShardError::invalid_argument(format!(
                    "unknown shard id {}",
                    shard_id
                ))
            })?;
            if picked.insert(*index) {
                shards.push(self.shards[*index].clone());
            }
        }
        Ok(shards)
    }

    /// Run `operation` on the shards serving `shard_ids` (every shard when
    /// `None`) with the factory's access strategy.
    pub async fn execute<T, X>(
        &self,
        shard_ids: Option<&[ShardId]>,
        operation: Arc<dyn ShardOperation<T>>,
        exit: &X,
        collector: Option<&dyn ExitOperationsCollector<X::Output>>,
    ) -> ShardResult<X::Output>
    where
        T: Send + 'static,
        X: ExitStrategy<T>,
    {
        self.ensure_open()?;
        let shards = match shard_ids {
            Some(ids) => self.shards_for(ids)?,
            None => self.shards.clone(),
        };
        self.access_strategy
            .apply(&shards, operation, exit, collector)
            .await
    }

    /// The session's current logical transaction.
    ///
    /// A new one is created on first use and after the previous one
    /// committed or rolled back.
    pub async fn transaction(&self) -> ShardResult<Arc<ShardedTransaction>> {
        self.ensure_open()?;
        let mut current = self.transaction.lock().await;
        if let Some(transaction) = current.as_ref() {
            if !matches!(
                transaction.status(),
                TransactionStatus::Committed | TransactionStatus::RolledBack
            ) {
                return Ok(transaction.clone());
            }
            debug!("previous transaction completed, starting a new one");
        }
        let transaction = ShardedTransaction::new(&self.shards).await;
        if let Some(seconds) = self.txn_timeout {
            transaction.set_timeout(seconds).await;
        }
        *current = Some(transaction.clone());
        Ok(transaction)
    }

    pub async fn begin_transaction(
        &self,
    ) -> ShardResult<Arc<ShardedTransaction>> {
        let transaction = self.transaction().await?;
        transaction.begin().await?;
        Ok(transaction)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close every open shard session. Reports the first failure after
    /// trying all shards.
    pub async fn close(&self) -> ShardResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(transaction) = self.transaction.lock().await.as_ref() {
            if transaction.is_active() {
                warn!(
                    "closing session with an unfinished transaction ({:?})",
                    transaction.status()
                );
            }
        }
        let mut first_error = None;
        for shard in &self.shards {
            if let Err(e) = shard.close().await {
                warn!("{}", e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        info!("closed session over {} shard(s)", self.shards.len());
        first_error.map_or(Ok(()), Err)
    }

    fn ensure_open(&self) -> ShardResult<()> {
        if self.is_closed() {
            Err(ShardError::transaction("session is closed"))
        } else {
            Ok(())
        }
    }
}
