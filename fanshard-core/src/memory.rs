//! In-memory native backend.
//!
//! Each [`MemorySessionFactory`] stands for one physical shard: a key/value
//! store of JSON values plus a transaction that stages writes until commit.
//! Fault switches make individual native calls fail once, which is how the
//! coordinator's partial-failure paths are exercised.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BoxError;
use crate::shard::{NativeSession, NativeSessionFactory, NativeTransaction};

#[derive(thiserror::Error, Debug)]
pub enum MemoryError {
    #[error("Injected fault on {0}")]
    InjectedFault(&'static str),
    #[error("Transaction already active")]
    AlreadyActive,
    #[error("Transaction not active")]
    NotActive,
    #[error("Session closed")]
    Closed,
}

/// Committed state of one memory shard.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.read().clone()
    }

    fn apply(&self, writes: BTreeMap<String, Option<Value>>) {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        for (key, value) in writes {
            match value {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
    }

    fn read(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Value>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One-shot failure switches shared by every session of a factory.
#[derive(Debug, Default)]
pub struct FaultPlan {
    fail_open: AtomicBool,
    fail_begin: AtomicBool,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
}

impl FaultPlan {
    pub fn fail_next_open(&self) {
        self.fail_open.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_begin(&self) {
        self.fail_begin.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_commit(&self) {
        self.fail_commit.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_rollback(&self) {
        self.fail_rollback.store(true, Ordering::SeqCst);
    }

    fn trip(flag: &AtomicBool, call: &'static str) -> Result<(), MemoryError> {
        if flag.swap(false, Ordering::SeqCst) {
            Err(MemoryError::InjectedFault(call))
        } else {
            Ok(())
        }
    }
}

/// Counters of native calls that reached the backend.
#[derive(Debug, Default)]
pub struct NativeCallStats {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub begins: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
}

#[derive(Debug, Default)]
pub struct MemorySessionFactory {
    store: Arc<MemoryStore>,
    faults: Arc<FaultPlan>,
    stats: Arc<NativeCallStats>,
}

impl MemorySessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    pub fn stats(&self) -> &NativeCallStats {
        &self.stats
    }

    pub fn opened_sessions(&self) -> usize {
        self.stats.opened.load(Ordering::SeqCst)
    }

    /// Write committed data directly, bypassing sessions.
    pub fn seed<K: Into<String>>(&self, key: K, value: Value) {
        let mut writes = BTreeMap::new();
        writes.insert(key.into(), Some(value));
        self.store.apply(writes);
    }
}

#[async_trait]
impl NativeSessionFactory for MemorySessionFactory {
    async fn open_session(&self) -> Result<Arc<dyn NativeSession>, BoxError> {
        FaultPlan::trip(&self.faults.fail_open, "open")?;
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        let transaction = Arc::new(MemoryTransaction {
            store: self.store.clone(),
            faults: self.faults.clone(),
            stats: self.stats.clone(),
            state: Mutex::new(TxState::default()),
        });
        Ok(Arc::new(MemorySession {
            transaction,
            stats: self.stats.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct MemorySession {
    transaction: Arc<MemoryTransaction>,
    stats: Arc<NativeCallStats>,
    closed: AtomicBool,
}

impl MemorySession {
    /// Borrow the memory session behind a native session handle.
    pub fn downcast(session: &Arc<dyn NativeSession>) -> Option<&MemorySession> {
        session.as_any().downcast_ref::<MemorySession>()
    }

    pub fn memory_transaction(&self) -> &Arc<MemoryTransaction> {
        &self.transaction
    }

    /// Read through the active transaction, if any.
    pub fn get(&self, key: &str) -> Result<Option<Value>, MemoryError> {
        self.ensure_open()?;
        let state = self.transaction.state();
        if let Some(staged) = state.staged.get(key) {
            return Ok(staged.clone());
        }
        Ok(self.transaction.store.get(key))
    }

    pub fn put<K: Into<String>>(
        &self,
        key: K,
        value: Value,
    ) -> Result<(), MemoryError> {
        self.write(key.into(), Some(value))
    }

    pub fn delete(&self, key: &str) -> Result<(), MemoryError> {
        self.write(key.to_string(), None)
    }

    /// Entries whose key starts with `prefix`, in key order.
    pub fn scan(&self, prefix: &str) -> Result<Vec<(String, Value)>, MemoryError> {
        self.ensure_open()?;
        let mut view = self.transaction.store.snapshot();
        for (key, value) in self.transaction.state().staged.iter() {
            match value {
                Some(value) => {
                    view.insert(key.clone(), value.clone());
                }
                None => {
                    view.remove(key);
                }
            }
        }
        Ok(view
            .into_iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .collect())
    }

    fn write(
        &self,
        key: String,
        value: Option<Value>,
    ) -> Result<(), MemoryError> {
        self.ensure_open()?;
        let mut state = self.transaction.state();
        if state.status == MemoryTxStatus::Active {
            state.staged.insert(key, value);
        } else {
            drop(state);
            let mut writes = BTreeMap::new();
            writes.insert(key, value);
            self.transaction.store.apply(writes);
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), MemoryError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MemoryError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NativeSession for MemorySession {
    fn transaction(&self) -> Arc<dyn NativeTransaction> {
        self.transaction.clone()
    }

    async fn close(&self) -> Result<(), BoxError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryTxStatus {
    #[default]
    Idle,
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug, Default)]
struct TxState {
    status: MemoryTxStatus,
    staged: BTreeMap<String, Option<Value>>,
    timeout: Option<u32>,
}

pub struct MemoryTransaction {
    store: Arc<MemoryStore>,
    faults: Arc<FaultPlan>,
    stats: Arc<NativeCallStats>,
    state: Mutex<TxState>,
}

impl MemoryTransaction {
    pub fn status(&self) -> MemoryTxStatus {
        self.state().status
    }

    pub fn timeout(&self) -> Option<u32> {
        self.state().timeout
    }

    fn state(&self) -> MutexGuard<'_, TxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl NativeTransaction for MemoryTransaction {
    async fn begin(&self) -> Result<(), BoxError> {
        FaultPlan::trip(&self.faults.fail_begin, "begin")?;
        let mut state = self.state();
        if state.status == MemoryTxStatus::Active {
            return Err(MemoryError::AlreadyActive.into());
        }
        state.status = MemoryTxStatus::Active;
        state.staged.clear();
        self.stats.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<(), BoxError> {
        let mut state = self.state();
        if state.status != MemoryTxStatus::Active {
            return Err(MemoryError::NotActive.into());
        }
        FaultPlan::trip(&self.faults.fail_commit, "commit")?;
        let writes = std::mem::take(&mut state.staged);
        self.store.apply(writes);
        state.status = MemoryTxStatus::Committed;
        self.stats.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), BoxError> {
        let mut state = self.state();
        if state.status != MemoryTxStatus::Active {
            return Ok(());
        }
        FaultPlan::trip(&self.faults.fail_rollback, "rollback")?;
        state.staged.clear();
        state.status = MemoryTxStatus::RolledBack;
        self.stats.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.state().status == MemoryTxStatus::Active
    }

    fn was_committed(&self) -> bool {
        self.state().status == MemoryTxStatus::Committed
    }

    fn set_timeout(&self, seconds: u32) {
        self.state().timeout = Some(seconds);
    }
}
