use std::sync::Arc;

use envconfig::Envconfig;
use fanshard_core::memory::{MemorySession, MemorySessionFactory};
use fanshard_core::{
    AggregateExitStrategy, AggregateFunction, BoxError,
    ConcatenateListsExitStrategy, FanshardConfig,
    FirstNonNullResultExitStrategy, Order, PropertyAccessors,
    ResultListCollector, ShardId, ShardOperation, ShardRef,
    ShardedSessionFactoryBuilder, operation,
};
use serde_json::{Value, json};
use tracing::{debug, info};

#[derive(Envconfig, Clone, Debug)]
struct DevConfig {
    #[envconfig(from = "FANSHARD_DEV_SHARDS", default = "4")]
    shards: u64,
    #[envconfig(from = "FANSHARD_DEV_KEYS", default = "32")]
    keys: u64,
    #[envconfig(nested = true)]
    fanshard: FanshardConfig,
}

fn main() -> anyhow::Result<()> {
    init_log();
    let conf = DevConfig::init_from_env()?;
    debug!("use fanshard-dev config: {:?}", conf);
    let worker_threads = num_cpus::get();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;
    runtime.block_on(run(conf))
}

async fn run(conf: DevConfig) -> anyhow::Result<()> {
    let backends: Vec<_> = (0..conf.shards)
        .map(|_| Arc::new(MemorySessionFactory::new()))
        .collect();
    let mut builder = ShardedSessionFactoryBuilder::from_config(&conf.fanshard);
    for (id, backend) in backends.iter().enumerate() {
        builder = builder.add_shard(id as u64, backend.clone());
    }
    let factory = builder.build()?;
    let session = factory.open_session()?;

    let mut virtual_ids: Vec<ShardId> = session
        .shards()
        .iter()
        .flat_map(|s| s.shard_ids().iter().copied())
        .collect();
    virtual_ids.sort();
    info!(
        "{} physical shard(s) serving {} virtual shard(s) with {:?}",
        factory.physical_shard_ids().len(),
        virtual_ids.len(),
        factory.access_strategy()
    );

    let tx = session.begin_transaction().await?;
    for n in 0..conf.keys {
        let target = virtual_ids[(n as usize) % virtual_ids.len()];
        let key = format!("item/{:04}", n);
        let row = json!({ "key": key, "score": (n * 37) % 101 });
        let exit = FirstNonNullResultExitStrategy::new();
        session
            .execute(Some(&[target]), put_op(key, row), &exit, None)
            .await?;
    }
    tx.commit().await?;
    info!(
        "committed {} key(s) across shards {:?}",
        conf.keys,
        tx.enlisted_shards().await
    );

    let exit = AggregateExitStrategy::new(AggregateFunction::Sum);
    let total = session.execute(None, count_op("item/"), &exit, None).await?;
    info!("row count over all shards: {:?}", total);

    let exit = ConcatenateListsExitStrategy::new();
    let collector =
        ResultListCollector::new(PropertyAccessors::json_paths(["score"]))
            .order_by(Order::desc("score"))
            .max_results(5);
    let top = session
        .execute(None, scan_op("item/"), &exit, Some(&collector))
        .await?;
    for row in &top {
        info!("top: {}", row);
    }

    for (id, backend) in backends.iter().enumerate() {
        debug!("shard {} holds {} row(s)", id, backend.store().len());
    }
    session.close().await?;
    Ok(())
}

fn memory_of(
    session: &Arc<dyn fanshard_core::NativeSession>,
) -> Result<&MemorySession, BoxError> {
    Ok(MemorySession::downcast(session).ok_or("not a memory session")?)
}

fn put_op(key: String, row: Value) -> Arc<dyn ShardOperation<ShardId>> {
    operation("put", move |shard: ShardRef| {
        let key = key.clone();
        let row = row.clone();
        async move {
            let native = shard.establish_session().await?;
            memory_of(&native)?.put(key, row)?;
            Ok(Some(shard.physical_id()))
        }
    })
}

fn count_op(prefix: &'static str) -> Arc<dyn ShardOperation<u64>> {
    operation("count", move |shard: ShardRef| async move {
        let native = shard.establish_session().await?;
        let rows = memory_of(&native)?.scan(prefix)?;
        Ok(Some(rows.len() as u64))
    })
}

fn scan_op(prefix: &'static str) -> Arc<dyn ShardOperation<Vec<Value>>> {
    operation("scan", move |shard: ShardRef| async move {
        let native = shard.establish_session().await?;
        let rows = memory_of(&native)?.scan(prefix)?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(rows.into_iter().map(|(_, v)| v).collect()))
    })
}

fn init_log() {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{
        EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("FANSHARD_LOG")
                .from_env_lossy(),
        )
        .init();
}
