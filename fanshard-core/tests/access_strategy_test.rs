mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{TestCluster, put_op, scan_op};
use fanshard_core::{
    AggregateExitStrategy, AggregateFunction, ConcatenateListsExitStrategy,
    FirstNonNullResultExitStrategy, MergeOrder, Order,
    ParallelShardAccessStrategy, PropertyAccessors, ResultListCollector,
    SequentialShardAccessStrategy, ShardError, ShardId, ShardOrdering,
    ShardRef, operation,
};
use serde_json::{Value, json};

fn recorder(
    visited: Arc<Mutex<Vec<u64>>>,
    answer_on: u64,
) -> Arc<dyn fanshard_core::ShardOperation<u64>> {
    operation("lookup", move |shard: ShardRef| {
        let visited = visited.clone();
        async move {
            let id = shard.physical_id().get();
            visited.lock().unwrap().push(id);
            Ok((id >= answer_on).then_some(id * 100))
        }
    })
}

#[tokio::test]
async fn sequential_visits_in_input_order_until_stop() {
    let cluster = TestCluster::new(6, SequentialShardAccessStrategy::new());
    let session = cluster.session();
    let visited = Arc::new(Mutex::new(Vec::new()));
    let exit = FirstNonNullResultExitStrategy::new();

    let out = session
        .execute(None, recorder(visited.clone(), 3), &exit, None)
        .await
        .unwrap();

    assert_eq!(out, Some(300));
    assert_eq!(*visited.lock().unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(
        exit.shard_of_result().unwrap().physical_id(),
        ShardId::new(3)
    );
}

#[tokio::test]
async fn sequential_round_robin_spreads_first_shard() {
    let strategy = SequentialShardAccessStrategy::new()
        .with_ordering(ShardOrdering::round_robin());
    let cluster = TestCluster::new(3, strategy);
    let session = cluster.session();

    let mut winners = Vec::new();
    for _ in 0..3 {
        let exit = FirstNonNullResultExitStrategy::new();
        let visited = Arc::new(Mutex::new(Vec::new()));
        session
            .execute(None, recorder(visited, 0), &exit, None)
            .await
            .unwrap();
        winners.push(exit.shard_of_result().unwrap().physical_id().get());
    }
    assert_eq!(winners, vec![0, 1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_matches_sequential_for_first_non_null() {
    let op = operation("slow_lookup", |shard: ShardRef| async move {
        let id = shard.physical_id().get();
        // later shards answer first
        tokio::time::sleep(Duration::from_millis(10 * (5 - id))).await;
        Ok((id % 2 == 1).then_some(id))
    });

    let sequential = TestCluster::new(5, SequentialShardAccessStrategy::new());
    let exit = FirstNonNullResultExitStrategy::new();
    let expected = sequential
        .session()
        .execute(None, op.clone(), &exit, None)
        .await
        .unwrap();

    let parallel = TestCluster::new(
        5,
        ParallelShardAccessStrategy::new().with_max_concurrency(5),
    );
    let exit = FirstNonNullResultExitStrategy::new();
    let out = parallel
        .session()
        .execute(None, op, &exit, None)
        .await
        .unwrap();

    assert_eq!(expected, Some(1));
    assert_eq!(out, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_aggregates_are_order_independent() {
    let op = operation("rows", |shard: ShardRef| async move {
        let id = shard.physical_id().get() as i64;
        tokio::time::sleep(Duration::from_millis(rand::random_range(0..10)))
            .await;
        Ok((id != 2).then_some(id * 10))
    });
    for merge_order in [MergeOrder::ShardOrder, MergeOrder::Completion] {
        let cluster = TestCluster::new(
            5,
            ParallelShardAccessStrategy::new()
                .with_merge_order(merge_order)
                .with_ordering(ShardOrdering::Random),
        );
        let session = cluster.session();
        let sum = AggregateExitStrategy::new(AggregateFunction::Sum);
        let max = AggregateExitStrategy::new(AggregateFunction::Max);
        let count = AggregateExitStrategy::new(AggregateFunction::Count);
        assert_eq!(
            session.execute(None, op.clone(), &sum, None).await.unwrap(),
            Some(80)
        );
        assert_eq!(
            session.execute(None, op.clone(), &max, None).await.unwrap(),
            Some(40)
        );
        assert_eq!(
            session.execute(None, op.clone(), &count, None).await.unwrap(),
            Some(4)
        );
    }
}

#[tokio::test]
async fn concatenate_filters_nulls_and_keeps_order() {
    let cluster = TestCluster::new(3, SequentialShardAccessStrategy::new());
    let op = operation("lists", |shard: ShardRef| async move {
        Ok(match shard.physical_id().get() {
            0 => Some(vec![1, 2]),
            1 => None,
            _ => Some(vec![3]),
        })
    });
    let exit = ConcatenateListsExitStrategy::new();
    let out = cluster
        .session()
        .execute(None, op, &exit, None)
        .await
        .unwrap();
    assert_eq!(out, vec![1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn global_sort_and_limit_over_shards() {
    let cluster = TestCluster::new(
        3,
        ParallelShardAccessStrategy::new().with_merge_order(MergeOrder::Completion),
    );
    for (shard, rows) in [
        (0, vec![json!({"name": "dora", "score": 7})]),
        (1, vec![json!({"name": "eve"}), json!({"name": "ann", "score": 9.5})]),
        (2, vec![json!({"name": "bo", "score": 3})]),
    ] {
        for (i, row) in rows.into_iter().enumerate() {
            cluster.backend(shard).seed(format!("user/{}", i), row);
        }
    }

    let exit = ConcatenateListsExitStrategy::new();
    let collector =
        ResultListCollector::new(PropertyAccessors::json_paths(["score"]))
            .order_by(Order::desc("score"))
            .max_results(3);
    let out: Vec<Value> = cluster
        .session()
        .execute(None, scan_op("user/"), &exit, Some(&collector))
        .await
        .unwrap();
    let names: Vec<&str> =
        out.iter().map(|r| r["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["ann", "dora", "bo"]);
}

#[tokio::test]
async fn execute_on_selected_shards() {
    let cluster = TestCluster::new(4, SequentialShardAccessStrategy::new());
    let session = cluster.session();
    let exit = ConcatenateListsExitStrategy::new();
    let op = operation("ids", |shard: ShardRef| async move {
        Ok(Some(vec![shard.physical_id().get()]))
    });
    let ids = [ShardId::new(3), ShardId::new(1), ShardId::new(3)];
    let out = session
        .execute(Some(&ids), op, &exit, None)
        .await
        .unwrap();
    assert_eq!(out, vec![3, 1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_failure_reports_completed_shards() {
    let cluster = TestCluster::new(
        4,
        ParallelShardAccessStrategy::new().with_max_concurrency(4),
    );
    cluster.backend(2).faults().fail_next_open();
    let exit = AggregateExitStrategy::new(AggregateFunction::Count);
    let err = cluster
        .session()
        .execute(None, put_op("touched"), &exit, None)
        .await
        .unwrap_err();

    let ShardError::OperationFailure {
        failures, completed, ..
    } = &err
    else {
        panic!("unexpected error {:?}", err);
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].shard, ShardId::new(2));
    assert!(!completed.contains(&ShardId::new(2)));
    assert_eq!(err.completed_shards(), completed.as_slice());
    for id in completed {
        assert!(cluster.backend(id.get()).store().get("touched").is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sum_overflow_is_reported() {
    let cluster = TestCluster::new(2, ParallelShardAccessStrategy::new());
    let op = operation("big", |_shard: ShardRef| async move {
        Ok(Some(i32::MAX))
    });
    let exit = AggregateExitStrategy::new(AggregateFunction::Sum);
    let err = cluster
        .session()
        .execute(None, op, &exit, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ShardError::Overflow(_)));
}
