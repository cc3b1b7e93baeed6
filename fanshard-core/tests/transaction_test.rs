mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{RecordingSync, TestCluster, put_op};
use fanshard_core::memory::MemorySession;
use fanshard_core::{
    AggregateExitStrategy, AggregateFunction, BoxError, CompletionStatus,
    SequentialShardAccessStrategy, ShardError, ShardId, Synchronization,
    TransactionStatus,
};
use tracing_test::traced_test;

/// Captures the number of native commits seen at each callback.
struct CommitWatcher {
    cluster_commits: Arc<dyn Fn() -> usize + Send + Sync>,
    before: AtomicUsize,
    after: AtomicUsize,
    before_calls: AtomicUsize,
    after_calls: AtomicUsize,
}

impl Synchronization for CommitWatcher {
    fn before_completion(&self) -> Result<(), BoxError> {
        self.before_calls.fetch_add(1, Ordering::SeqCst);
        self.before
            .store((self.cluster_commits)(), Ordering::SeqCst);
        Err("before hook failed".into())
    }

    fn after_completion(&self, _status: CompletionStatus) -> Result<(), BoxError> {
        self.after_calls.fetch_add(1, Ordering::SeqCst);
        self.after.store((self.cluster_commits)(), Ordering::SeqCst);
        panic!("after hook exploded");
    }
}

struct Panicky;

impl Synchronization for Panicky {
    fn before_completion(&self) -> Result<(), BoxError> {
        panic!("before hook exploded");
    }

    fn after_completion(&self, _status: CompletionStatus) -> Result<(), BoxError> {
        Err("after hook failed".into())
    }
}

fn commits(cluster: &Arc<TestCluster>) -> Arc<dyn Fn() -> usize + Send + Sync> {
    let cluster = cluster.clone();
    Arc::new(move || {
        cluster
            .backends
            .iter()
            .map(|b| b.stats().commits.load(Ordering::SeqCst))
            .sum()
    })
}

#[tokio::test]
async fn writes_apply_only_on_commit() {
    let cluster = TestCluster::new(3, SequentialShardAccessStrategy::new());
    let session = cluster.session();
    let tx = session.begin_transaction().await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::Active);

    let exit = AggregateExitStrategy::new(AggregateFunction::Count);
    let written = session
        .execute(None, put_op("greeting"), &exit, None)
        .await
        .unwrap();
    assert_eq!(written, Some(3));
    // sessions opened after begin were enlisted and begun on open
    assert_eq!(tx.enlisted_shards().await.len(), 3);
    assert!(cluster.backends.iter().all(|b| b.store().is_empty()));

    tx.commit().await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::Committed);
    for (id, backend) in cluster.backends.iter().enumerate() {
        assert_eq!(
            backend.store().get("greeting"),
            Some(serde_json::Value::from(id as u64))
        );
    }
}

#[traced_test]
#[tokio::test]
async fn synchronizations_wrap_native_commits() {
    let cluster = Arc::new(TestCluster::new(
        3,
        SequentialShardAccessStrategy::new(),
    ));
    let session = cluster.session();
    for shard in session.shards() {
        shard.establish_session().await.unwrap();
    }
    let tx = session.transaction().await.unwrap();
    let watcher = Arc::new(CommitWatcher {
        cluster_commits: commits(&cluster),
        before: AtomicUsize::new(usize::MAX),
        after: AtomicUsize::new(usize::MAX),
        before_calls: AtomicUsize::new(0),
        after_calls: AtomicUsize::new(0),
    });
    let recording = Arc::new(RecordingSync::default());
    tx.register_synchronization(Some(watcher.clone())).unwrap();
    tx.register_synchronization(Some(Arc::new(Panicky))).unwrap();
    tx.register_synchronization(Some(recording.clone())).unwrap();

    tx.begin().await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(watcher.before_calls.load(Ordering::SeqCst), 1);
    assert_eq!(watcher.after_calls.load(Ordering::SeqCst), 1);
    assert_eq!(watcher.before.load(Ordering::SeqCst), 0);
    assert_eq!(watcher.after.load(Ordering::SeqCst), 3);
    assert_eq!(
        *recording.events.lock().unwrap(),
        vec!["before".to_string(), "after:Committed".to_string()]
    );
    assert!(logs_contain("exception calling user Synchronization"));
    assert!(logs_contain("user Synchronization panicked"));
}

#[tokio::test]
async fn partial_commit_then_rollback_skips_committed() {
    let cluster = TestCluster::new(3, SequentialShardAccessStrategy::new());
    let session = cluster.session();
    for shard in session.shards() {
        shard.establish_session().await.unwrap();
    }
    let tx = session.begin_transaction().await.unwrap();
    let recording = Arc::new(RecordingSync::default());
    tx.register_synchronization(Some(recording.clone())).unwrap();

    let exit = AggregateExitStrategy::new(AggregateFunction::Count);
    session
        .execute(None, put_op("k"), &exit, None)
        .await
        .unwrap();
    cluster.backend(1).faults().fail_next_commit();

    let err = tx.commit().await.unwrap_err();
    match &err {
        ShardError::CommitFailure {
            shard, committed, ..
        } => {
            assert_eq!(*shard, ShardId::new(1));
            assert_eq!(committed, &vec![ShardId::new(0)]);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(tx.status(), TransactionStatus::FailedCommit);
    assert!(tx.is_active());
    assert!(matches!(tx.begin().await, Err(ShardError::Transaction(_))));

    tx.rollback().await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::RolledBack);

    let rollbacks: Vec<usize> = cluster
        .backends
        .iter()
        .map(|b| b.stats().rollbacks.load(Ordering::SeqCst))
        .collect();
    assert_eq!(rollbacks, vec![0, 1, 1]);
    assert!(cluster.backend(0).store().get("k").is_some());
    assert!(cluster.backend(1).store().get("k").is_none());
    assert!(cluster.backend(2).store().get("k").is_none());
    assert_eq!(
        *recording.events.lock().unwrap(),
        vec![
            "before".to_string(),
            "after:Unknown".to_string(),
            "after:RolledBack".to_string()
        ]
    );
}

#[tokio::test]
async fn rollback_failures_are_collected() {
    let cluster = TestCluster::new(3, SequentialShardAccessStrategy::new());
    let session = cluster.session();
    for shard in session.shards() {
        shard.establish_session().await.unwrap();
    }
    let tx = session.begin_transaction().await.unwrap();
    cluster.backend(0).faults().fail_next_rollback();
    cluster.backend(2).faults().fail_next_rollback();

    let err = tx.rollback().await.unwrap_err();
    let ShardError::RollbackFailure { failures } = err else {
        panic!("expected a rollback failure");
    };
    let failed: Vec<ShardId> = failures.iter().map(|f| f.shard).collect();
    assert_eq!(failed, vec![ShardId::new(0), ShardId::new(2)]);
    assert_eq!(
        cluster.backend(1).stats().rollbacks.load(Ordering::SeqCst),
        1
    );
    assert_eq!(tx.status(), TransactionStatus::Active);

    tx.rollback().await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::RolledBack);
}

#[tokio::test]
async fn begin_failure_leaves_nothing_active() {
    let cluster = TestCluster::new(4, SequentialShardAccessStrategy::new());
    let session = cluster.session();
    for shard in session.shards() {
        shard.establish_session().await.unwrap();
    }
    cluster.backend(2).faults().fail_next_begin();

    let err = session.begin_transaction().await.unwrap_err();
    assert!(matches!(err, ShardError::BeginFailure { .. }));
    let tx = session.transaction().await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::Created);
    assert!(!tx.is_active());
    for shard in session.shards() {
        assert!(!shard.session().unwrap().transaction().is_active());
    }
}

#[tokio::test]
async fn timeout_reaches_current_and_late_shards() {
    let cluster = TestCluster::new(2, SequentialShardAccessStrategy::new());
    let session = cluster.session();
    session.shards()[0].establish_session().await.unwrap();
    let tx = session.transaction().await.unwrap();
    tx.set_timeout(45).await;
    assert_eq!(tx.timeout(), Some(45));

    session.shards()[1].establish_session().await.unwrap();
    for shard in session.shards() {
        let native = shard.session().unwrap();
        let memory = MemorySession::downcast(&native).unwrap();
        assert_eq!(memory.memory_transaction().timeout(), Some(45));
    }
}

#[tokio::test]
async fn failed_late_begin_keeps_writes_inside_the_transaction() {
    let cluster = TestCluster::new(2, SequentialShardAccessStrategy::new());
    let session = cluster.session();
    let tx = session.begin_transaction().await.unwrap();
    cluster.backend(1).faults().fail_next_begin();

    let err = session.shards()[1].establish_session().await.unwrap_err();
    assert!(matches!(err, ShardError::BeginFailure { .. }));
    assert!(!session.shards()[1].has_session());
    assert!(tx.enlisted_shards().await.is_empty());

    // the next open enlists a fresh session and begins it
    let exit = AggregateExitStrategy::new(AggregateFunction::Count);
    let written = session
        .execute(Some(&[ShardId::new(1)]), put_op("leak"), &exit, None)
        .await
        .unwrap();
    assert_eq!(written, Some(1));
    assert_eq!(tx.enlisted_shards().await, vec![ShardId::new(1)]);
    assert!(cluster.backend(1).store().get("leak").is_none());

    tx.rollback().await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::RolledBack);
    assert!(cluster.backend(1).store().get("leak").is_none());
    assert_eq!(cluster.backend(1).opened_sessions(), 2);
    assert_eq!(
        cluster.backend(1).stats().closed.load(Ordering::SeqCst),
        1
    );
}
