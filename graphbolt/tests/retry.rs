//! The managed transaction loop: backoff, jitter, error classification.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use graphbolt::pool::routing::RoutingPool;
use graphbolt::protocol::Value;
use graphbolt::session::ManagedTransaction;
use graphbolt::{AccessMode, Error, PoolConfig, Session, SessionConfig, StaticResolver};

use common::{addr, FakeCluster, FakeOpener, Failure};

fn routing_pool(cluster: &FakeCluster) -> Arc<RoutingPool<FakeOpener>> {
    Arc::new(
        RoutingPool::new(
            vec![addr(7001)],
            cluster.opener(),
            Arc::new(StaticResolver::new()),
            PoolConfig::default(),
            None,
        )
        .unwrap(),
    )
}

fn session(pool: &Arc<RoutingPool<FakeOpener>>, retry_time: Duration) -> Session<FakeOpener> {
    Session::new(
        pool.clone(),
        SessionConfig::default()
            .with_default_access_mode(AccessMode::Write)
            .with_max_transaction_retry_time(retry_time)
            .with_retry_delays(0.01, 2.0, 0.2),
    )
}

fn work(mut tx: ManagedTransaction<'_, FakeOpener>) -> BoxFuture<'_, graphbolt::Result<i64>> {
    Box::pin(async move {
        let records = tx.run("RETURN 42 AS x", Default::default()).await?;
        match records[0].get("x") {
            Some(Value::Integer(x)) => Ok(*x),
            other => Err(Error::client(format!("unexpected value {other:?}"))),
        }
    })
}

fn failing_work(tx: ManagedTransaction<'_, FakeOpener>) -> BoxFuture<'_, graphbolt::Result<i64>> {
    Box::pin(async move {
        drop(tx);
        Err(Error::client("unit of work gave up"))
    })
}

#[tokio::test(start_paused = true)]
async fn retries_transient_failures_with_jittered_backoff() {
    let cluster = FakeCluster::single(addr(7001));
    cluster.with_state(|s| {
        s.records = vec![common::record_x(42)];
        s.commit_failures = vec![Failure::transient(), Failure::transient(), Failure::transient()]
            .into_iter()
            .collect();
    });
    let pool = routing_pool(&cluster);
    let mut session = session(&pool, Duration::from_secs(10));

    let value = session.execute_write(work).await.unwrap();
    assert_eq!(value, 42);
    session.close().await.unwrap();

    // four attempts: three failed commits, then success
    let times = cluster.begin_times();
    assert_eq!(times.len(), 4);

    // delays between attempts follow 0.01 * 2^n within the 20% jitter band
    let expected = [(0.008, 0.012), (0.016, 0.024), (0.032, 0.048)];
    for (i, (lo, hi)) in expected.iter().enumerate() {
        let gap = (times[i + 1] - times[i]).as_secs_f64();
        assert!(gap >= *lo - 1e-6, "gap {i}: {gap} < {lo}");
        assert!(gap <= *hi + 1e-6, "gap {i}: {gap} > {hi}");
    }
}

#[tokio::test(start_paused = true)]
async fn non_retryable_errors_surface_immediately() {
    let cluster = FakeCluster::single(addr(7001));
    let pool = routing_pool(&cluster);
    let mut session = session(&pool, Duration::from_secs(10));

    let err = session.execute_write(failing_work).await.unwrap_err();
    assert!(matches!(err, Error::Client(_)));
    // a single attempt, rolled back
    assert_eq!(cluster.begin_count(), 1);
    assert_eq!(cluster.rollbacks(), 1);
    session.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_the_retry_time_and_reraises_the_last_error() {
    let cluster = FakeCluster::single(addr(7001));
    cluster.with_state(|s| {
        // every commit fails
        s.commit_failures = std::iter::repeat_with(Failure::transient).take(64).collect();
    });
    let pool = routing_pool(&cluster);
    let mut session = session(&pool, Duration::from_millis(50));

    let err = session.execute_write(work).await.unwrap_err();
    assert!(matches!(err, Error::Server(_)), "{err}");
    let attempts = cluster.begin_count();
    assert!(attempts >= 2, "expected at least one retry, got {attempts}");
    assert!(attempts < 16, "loop failed to terminate, {attempts} attempts");
    session.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn read_transactions_run_against_readers() {
    let cluster = FakeCluster::new();
    cluster.set_roles(vec![addr(7001)], vec![addr(7002)], vec![addr(7001)]);
    cluster.with_state(|s| s.records = vec![common::record_x(42)]);
    let pool = routing_pool(&cluster);
    let mut session = session(&pool, Duration::from_secs(10));

    let value = session.execute_read(work).await.unwrap();
    assert_eq!(value, 42);
    session.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn writer_invalidation_triggers_rerouting_mid_loop() {
    let cluster = FakeCluster::new();
    cluster.set_roles(vec![addr(7001)], vec![addr(7001)], vec![addr(7001)]);
    cluster.with_state(|s| {
        s.records = vec![common::record_x(42)];
        s.commit_failures.push_back(Failure::Server(graphbolt::ServerError::new(
            "Neo.ClientError.Cluster.NotALeader",
            "leader moved",
        )));
    });
    let pool = routing_pool(&cluster);
    let mut session = session(&pool, Duration::from_secs(10));

    // first attempt hits NotALeader, the writer is dropped from the table,
    // rediscovery repopulates it and the retry succeeds
    let value = session.execute_write(work).await.unwrap();
    assert_eq!(value, 42);
    assert_eq!(cluster.begin_count(), 2);
    session.close().await.unwrap();
}
