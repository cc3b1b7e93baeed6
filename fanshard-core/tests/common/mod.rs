use std::sync::{Arc, Mutex};

use fanshard_core::memory::{MemorySession, MemorySessionFactory};
use fanshard_core::{
    BoxError, CompletionStatus, ShardAccessStrategy, ShardOperation, ShardRef,
    ShardedSession, ShardedSessionFactory, Synchronization, operation,
};
use serde_json::Value;

/// Physical memory shards `0..n` behind one session factory.
#[allow(dead_code)]
pub struct TestCluster {
    pub backends: Vec<Arc<MemorySessionFactory>>,
    pub factory: ShardedSessionFactory,
}

#[allow(dead_code)]
impl TestCluster {
    pub fn new(shards: u64, strategy: impl Into<ShardAccessStrategy>) -> Self {
        let backends: Vec<_> = (0..shards)
            .map(|_| Arc::new(MemorySessionFactory::new()))
            .collect();
        let mut builder =
            ShardedSessionFactory::builder().access_strategy(strategy);
        for (id, backend) in backends.iter().enumerate() {
            builder = builder.add_shard(id as u64, backend.clone());
        }
        let factory = builder.build().expect("valid cluster");
        Self { backends, factory }
    }

    pub fn session(&self) -> ShardedSession {
        self.factory.open_session().expect("session")
    }

    pub fn backend(&self, shard: u64) -> &MemorySessionFactory {
        &self.backends[shard as usize]
    }
}

/// Run `f` against the memory session of `shard`, opening it if needed.
#[allow(dead_code)]
pub async fn with_memory<R>(
    shard: &ShardRef,
    f: impl FnOnce(&MemorySession) -> Result<R, BoxError>,
) -> Result<R, BoxError> {
    let session = shard.establish_session().await?;
    let memory =
        MemorySession::downcast(&session).ok_or("not a memory session")?;
    f(memory)
}

/// Writes `key` with the shard id as value on every shard it runs on.
#[allow(dead_code)]
pub fn put_op(key: &'static str) -> Arc<dyn ShardOperation<u64>> {
    operation("put", move |shard: ShardRef| async move {
        let id = shard.physical_id().get();
        with_memory(&shard, |m| Ok(m.put(key, Value::from(id))?)).await?;
        Ok(Some(id))
    })
}

/// Reads every value under `prefix`.
#[allow(dead_code)]
pub fn scan_op(prefix: &'static str) -> Arc<dyn ShardOperation<Vec<Value>>> {
    operation("scan", move |shard: ShardRef| async move {
        let rows = with_memory(&shard, |m| Ok(m.scan(prefix)?)).await?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(rows.into_iter().map(|(_, v)| v).collect()))
    })
}

/// Records every callback it receives.
#[allow(dead_code)]
#[derive(Default)]
pub struct RecordingSync {
    pub events: Mutex<Vec<String>>,
}

impl Synchronization for RecordingSync {
    fn before_completion(&self) -> Result<(), BoxError> {
        self.events.lock().unwrap().push("before".into());
        Ok(())
    }

    fn after_completion(&self, status: CompletionStatus) -> Result<(), BoxError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("after:{:?}", status));
        Ok(())
    }
}
