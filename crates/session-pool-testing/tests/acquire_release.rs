//! Acquisition and release behaviour of the session pool.
//!
//! Every test drives a real [`SessionPool`] against the in-memory
//! [`MockSessionFactory`]; no backing store is required.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use session_pool::{
    Capability, DatabaseName, FactoryError, PoolConfig, PoolError, SessionPool,
};
use session_pool_testing::{MockSessionFactory, eventually};
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_secs(2);

fn db() -> DatabaseName {
    DatabaseName::new("projects/p/instances/i/databases/orders")
}

/// A pool without warm sessions, so only callers trigger creations.
async fn pool_with(factory: &MockSessionFactory, config: PoolConfig) -> SessionPool {
    SessionPool::new(factory.shared(), config.min_sessions(0))
        .await
        .unwrap()
}

fn pending(pool: &SessionPool) -> u32 {
    pool.statistics().total_pending_acquisition_count()
}

#[tokio::test]
async fn test_idle_session_is_reused() {
    let factory = MockSessionFactory::new();
    let pool = pool_with(&factory, PoolConfig::new()).await;

    let first = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();
    let name = first.name().to_string();
    drop(first);

    let second = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();
    assert_eq!(second.name(), name);
    assert_eq!(factory.create_calls(), 1);
}

#[tokio::test]
async fn test_most_recently_returned_session_is_leased_first() {
    let factory = MockSessionFactory::new();
    let pool = pool_with(&factory, PoolConfig::new()).await;

    let a = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();
    let b = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();
    let (name_a, name_b) = (a.name().to_string(), b.name().to_string());

    drop(a);
    tokio::time::sleep(Duration::from_millis(2)).await;
    drop(b);

    let next = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();
    assert_eq!(next.name(), name_b);
    assert_ne!(next.name(), name_a);
}

#[tokio::test]
async fn test_single_slot_waiter_receives_released_session() {
    let factory = MockSessionFactory::new();
    let pool = Arc::new(pool_with(&factory, PoolConfig::new().max_sessions(1)).await);

    let first = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();
    let first_name = first.name().to_string();

    let waiter_pool = pool.clone();
    let second =
        tokio::spawn(async move { waiter_pool.acquire(&db(), Capability::ReadOnly).await });

    assert!(eventually(WAIT, || pending(&pool) == 1).await);
    drop(first);

    let second = second.await.unwrap().unwrap();
    assert_eq!(second.name(), first_name);
    assert_eq!(factory.create_calls(), 1);
}

#[tokio::test]
async fn test_waiters_are_served_in_fifo_order() {
    let factory = MockSessionFactory::new();
    let pool = Arc::new(pool_with(&factory, PoolConfig::new().max_sessions(1)).await);

    let held = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();
    let held_name = held.name().to_string();

    let p1 = pool.clone();
    let w1 = tokio::spawn(async move { p1.acquire(&db(), Capability::ReadOnly).await });
    assert!(eventually(WAIT, || pending(&pool) == 1).await);

    let p2 = pool.clone();
    let w2 = tokio::spawn(async move { p2.acquire(&db(), Capability::ReadOnly).await });
    assert!(eventually(WAIT, || pending(&pool) == 2).await);

    drop(held);
    let first = w1.await.unwrap().unwrap();
    assert_eq!(first.name(), held_name);
    assert_eq!(pending(&pool), 1);
    assert!(!w2.is_finished());

    drop(first);
    let second = w2.await.unwrap().unwrap();
    assert_eq!(second.name(), held_name);
    assert_eq!(factory.create_calls(), 1);
}

#[tokio::test]
async fn test_waiter_takes_released_session_of_its_class() {
    let factory = MockSessionFactory::new();
    let pool = Arc::new(pool_with(&factory, PoolConfig::new().max_sessions(2)).await);

    let _read_only = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();
    let read_write = pool.acquire(&db(), Capability::ReadWrite).await.unwrap();
    let rw_name = read_write.name().to_string();

    let p = pool.clone();
    let writer = tokio::spawn(async move { p.acquire(&db(), Capability::ReadWrite).await });
    assert!(eventually(WAIT, || pending(&pool) == 1).await);

    drop(read_write);
    let session = writer.await.unwrap().unwrap();
    assert_eq!(session.name(), rw_name);
    assert!(session.transaction().is_some());
    assert_eq!(factory.create_calls(), 2);
}

#[tokio::test]
async fn test_released_session_of_other_class_is_replaced_for_waiter() {
    let factory = MockSessionFactory::new();
    let pool = Arc::new(pool_with(&factory, PoolConfig::new().max_sessions(2)).await);

    let read_only = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();
    let ro_name = read_only.name().to_string();
    let _read_write = pool.acquire(&db(), Capability::ReadWrite).await.unwrap();

    let p = pool.clone();
    let writer = tokio::spawn(async move { p.acquire(&db(), Capability::ReadWrite).await });
    assert!(eventually(WAIT, || pending(&pool) == 1).await);

    // The read-only session cannot serve the writer, so it makes room.
    drop(read_only);
    let session = writer.await.unwrap().unwrap();
    assert_ne!(session.name(), ro_name);
    assert!(session.transaction().is_some());
    assert_eq!(factory.create_calls(), 3);
    assert!(eventually(WAIT, || factory.deleted_sessions() == vec![ro_name.clone()]).await);
    assert!(pool.statistics().per_database_statistics()[0].is_at_capacity());
}

#[tokio::test]
async fn test_full_pool_replaces_idle_session_of_other_class() {
    let factory = MockSessionFactory::new();
    let pool = pool_with(&factory, PoolConfig::new().max_sessions(1)).await;

    let writer = pool.acquire(&db(), Capability::ReadWrite).await.unwrap();
    let rw_name = writer.name().to_string();
    drop(writer);

    let reader = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();
    assert_eq!(reader.capability(), Capability::ReadOnly);
    assert_ne!(reader.name(), rw_name);
    assert_eq!(pool.statistics().total_read_write_pool_count(), 0);
    assert!(eventually(WAIT, || factory.deleted_sessions() == vec![rw_name.clone()]).await);
}

#[tokio::test]
async fn test_zero_deadline_on_saturated_pool_fails_immediately() {
    let factory = MockSessionFactory::new();
    let pool = pool_with(&factory, PoolConfig::new().max_sessions(1)).await;
    let _held = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();

    let err = pool
        .acquire_with_deadline(&db(), Capability::ReadOnly, Instant::now())
        .await
        .unwrap_err();

    assert!(matches!(err, PoolError::DeadlineExceeded { .. }));
    assert_eq!(pending(&pool), 0);
    assert_eq!(factory.create_calls(), 1);
}

#[tokio::test]
async fn test_deadline_expiry_removes_waiter() {
    let factory = MockSessionFactory::new();
    let pool = pool_with(&factory, PoolConfig::new().max_sessions(1)).await;
    let held = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();

    let deadline = Instant::now() + Duration::from_millis(30);
    let err = pool
        .acquire_with_deadline(&db(), Capability::ReadOnly, deadline)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::DeadlineExceeded { .. }));
    assert!(err.is_retryable());
    assert_eq!(pending(&pool), 0);

    // The expired waiter does not swallow the next release.
    drop(held);
    let stats = pool.statistics();
    assert_eq!(stats.total_read_pool_count(), 1);
    assert_eq!(stats.total_active_session_count(), 0);
}

#[tokio::test]
async fn test_cancelled_acquisition_leaves_no_waiter_behind() {
    let factory = MockSessionFactory::new();
    let pool = Arc::new(pool_with(&factory, PoolConfig::new().max_sessions(1)).await);
    let held = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();

    let p = pool.clone();
    let waiter = tokio::spawn(async move { p.acquire(&db(), Capability::ReadOnly).await });
    assert!(eventually(WAIT, || pending(&pool) == 1).await);

    waiter.abort();
    assert!(waiter.await.unwrap_err().is_cancelled());
    assert_eq!(pending(&pool), 0);

    drop(held);
    assert_eq!(pool.statistics().total_read_pool_count(), 1);
}

#[tokio::test]
async fn test_creation_finishing_after_caller_gave_up_is_kept() {
    let factory = MockSessionFactory::new();
    factory.hold_creations();
    let pool = pool_with(&factory, PoolConfig::new()).await;

    let deadline = Instant::now() + Duration::from_millis(20);
    let err = pool
        .acquire_with_deadline(&db(), Capability::ReadOnly, deadline)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::DeadlineExceeded { .. }));
    assert_eq!(pool.statistics().total_in_flight_creation_count(), 1);

    factory.open_creations();
    assert!(
        eventually(WAIT, || {
            let stats = pool.statistics();
            stats.total_in_flight_creation_count() == 0 && stats.total_read_pool_count() == 1
        })
        .await
    );
    assert_eq!(factory.live_sessions(), 1);
}

#[tokio::test]
async fn test_double_release_is_detected_without_changing_counters() {
    let factory = MockSessionFactory::new();
    let pool = pool_with(&factory, PoolConfig::new()).await;

    let session = pool
        .acquire(&db(), Capability::ReadOnly)
        .await
        .unwrap()
        .detach();
    assert_eq!(pool.statistics().total_active_session_count(), 1);

    assert_ok!(pool.release(session.clone()));
    let after_first = pool.statistics();

    let err = pool.release(session).unwrap_err();
    assert!(matches!(err, PoolError::DoubleRelease { .. }));
    assert_eq!(pool.statistics(), after_first);
    assert_eq!(after_first.total_read_pool_count(), 1);
    assert_eq!(after_first.total_active_session_count(), 0);
}

#[tokio::test]
async fn test_stale_release_after_session_was_leased_again_is_refused() {
    let factory = MockSessionFactory::new();
    let pool = pool_with(&factory, PoolConfig::new().max_sessions(1)).await;

    let first = pool
        .acquire(&db(), Capability::ReadOnly)
        .await
        .unwrap()
        .detach();
    assert_ok!(pool.release(first.clone()));

    let second = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();
    assert_eq!(second.name(), first.name());

    let err = pool.release(first).unwrap_err();
    assert!(matches!(err, PoolError::DoubleRelease { .. }));

    // The session is still leased to the second holder only.
    let stats = pool.statistics();
    assert_eq!(stats.total_active_session_count(), 1);
    assert_eq!(stats.total_read_pool_count(), 0);
    assert!(assert_ok!(pool.try_acquire(&db(), Capability::ReadOnly)).is_none());

    assert_ok!(second.release());
    assert_eq!(pool.statistics().total_read_pool_count(), 1);
}

#[tokio::test]
async fn test_unbounded_acquire_timeout_waits_for_release() {
    let factory = MockSessionFactory::new();
    let pool = Arc::new(
        pool_with(
            &factory,
            PoolConfig::new()
                .max_sessions(1)
                .acquire_timeout(Duration::MAX),
        )
        .await,
    );

    let held = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();
    let held_name = held.name().to_string();

    let p = pool.clone();
    let waiter = tokio::spawn(async move { p.acquire(&db(), Capability::ReadOnly).await });
    assert!(eventually(WAIT, || pending(&pool) == 1).await);

    drop(held);
    let session = waiter.await.unwrap().unwrap();
    assert_eq!(session.name(), held_name);
}

#[tokio::test]
async fn test_explicit_release_then_guard_is_consumed() {
    let factory = MockSessionFactory::new();
    let pool = pool_with(&factory, PoolConfig::new()).await;

    let session = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();
    assert_ok!(session.release());

    let stats = pool.statistics();
    assert_eq!(stats.total_read_pool_count(), 1);
    assert_eq!(stats.total_active_session_count(), 0);
}

#[tokio::test]
async fn test_invalid_session_is_deleted_and_waiter_gets_replacement() {
    let factory = MockSessionFactory::new();
    let pool = Arc::new(pool_with(&factory, PoolConfig::new().max_sessions(1)).await);

    let mut broken = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();
    let broken_name = broken.name().to_string();

    let p = pool.clone();
    let waiter = tokio::spawn(async move { p.acquire(&db(), Capability::ReadOnly).await });
    assert!(eventually(WAIT, || pending(&pool) == 1).await);

    broken.mark_invalid();
    drop(broken);

    let replacement = waiter.await.unwrap().unwrap();
    assert_ne!(replacement.name(), broken_name);
    assert_eq!(factory.create_calls(), 2);
    assert!(eventually(WAIT, || factory.deleted_sessions() == vec![broken_name.clone()]).await);
}

#[tokio::test]
async fn test_read_only_and_read_write_are_separate() {
    let factory = MockSessionFactory::new();
    let pool = pool_with(&factory, PoolConfig::new()).await;

    let writer = pool.acquire(&db(), Capability::ReadWrite).await.unwrap();
    assert_eq!(writer.capability(), Capability::ReadWrite);
    assert!(writer.transaction().is_some());
    drop(writer);

    let reader = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();
    assert_eq!(reader.capability(), Capability::ReadOnly);
    assert_eq!(factory.create_calls(), 2);
    assert_eq!(factory.begin_calls(), 1);
    assert_eq!(pool.statistics().total_read_write_pool_count(), 1);
}

#[tokio::test]
async fn test_read_write_reuse_for_read_only_when_enabled() {
    let factory = MockSessionFactory::new();
    let pool = pool_with(
        &factory,
        PoolConfig::new().reuse_read_write_for_read_only(true),
    )
    .await;

    let writer = pool.acquire(&db(), Capability::ReadWrite).await.unwrap();
    let name = writer.name().to_string();
    drop(writer);

    let reader = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();
    assert_eq!(reader.name(), name);
    assert_eq!(factory.create_calls(), 1);
}

#[tokio::test]
async fn test_idle_read_only_is_upgraded_when_factory_supports_it() {
    let factory = MockSessionFactory::new().with_read_write_upgrade(true);
    let pool = pool_with(&factory, PoolConfig::new()).await;

    let reader = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();
    let name = reader.name().to_string();
    drop(reader);

    let writer = pool.acquire(&db(), Capability::ReadWrite).await.unwrap();
    assert_eq!(writer.name(), name);
    assert!(writer.transaction().is_some());
    assert_eq!(factory.create_calls(), 1);
    assert_eq!(factory.begin_calls(), 1);
}

#[tokio::test]
async fn test_creation_failure_is_surfaced_to_its_caller() {
    let factory = MockSessionFactory::new();
    factory.fail_next_creates(1, FactoryError::unavailable("backend restarting"));
    let pool = pool_with(&factory, PoolConfig::new()).await;

    let err = pool.acquire(&db(), Capability::ReadOnly).await.unwrap_err();
    match &err {
        PoolError::CreationFailed { database, source } => {
            assert_eq!(database, &db());
            assert!(source.is_retryable());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(pool.statistics().total_in_flight_creation_count(), 0);

    // The caller decides to retry.
    assert_ok!(pool.acquire(&db(), Capability::ReadOnly).await);
    assert_eq!(pool.metrics().creations_failed, 1);
}

#[tokio::test]
async fn test_begin_failure_keeps_session_as_read_only() {
    let factory = MockSessionFactory::new();
    factory.fail_next_begin(FactoryError::permission_denied("no writes"));
    let pool = pool_with(&factory, PoolConfig::new()).await;

    let err = assert_err!(pool.acquire(&db(), Capability::ReadWrite).await);
    assert!(matches!(err, PoolError::CreationFailed { .. }));
    assert!(!err.is_retryable());

    let stats = pool.statistics();
    assert_eq!(stats.total_read_pool_count(), 1);
    assert_eq!(stats.total_read_write_pool_count(), 0);
    assert_eq!(stats.total_in_flight_creation_count(), 0);
}

#[tokio::test]
async fn test_try_acquire_never_creates() {
    let factory = MockSessionFactory::new();
    let pool = pool_with(&factory, PoolConfig::new()).await;

    assert!(pool.try_acquire(&db(), Capability::ReadOnly).unwrap().is_none());
    assert_eq!(factory.create_calls(), 0);

    drop(pool.acquire(&db(), Capability::ReadOnly).await.unwrap());
    let session = pool.try_acquire(&db(), Capability::ReadOnly).unwrap();
    assert!(session.is_some());
}

#[tokio::test]
async fn test_statistics_totals_match_per_database_sums() {
    let factory = MockSessionFactory::new();
    let pool = pool_with(&factory, PoolConfig::new()).await;
    let databases: Vec<DatabaseName> = (0..4)
        .map(|i| DatabaseName::new(format!("projects/p/instances/i/databases/db{i}")))
        .collect();

    let mut held = Vec::new();
    for (i, database) in databases.iter().enumerate() {
        for _ in 0..=i {
            held.push(pool.acquire(database, Capability::ReadOnly).await.unwrap());
        }
        drop(pool.acquire(database, Capability::ReadWrite).await.unwrap());
    }
    // Return every other read-only session.
    let mut index = 0;
    held.retain(|_| {
        index += 1;
        index % 2 == 0
    });

    let stats = pool.statistics();
    let per_db = stats.per_database_statistics();
    assert_eq!(per_db.len(), 4);
    let sum = |f: fn(&session_pool::DatabaseStatistics) -> u32| per_db.iter().map(f).sum::<u32>();

    assert_eq!(stats.total_read_pool_count(), sum(|d| d.read_pool_count));
    assert_eq!(stats.total_read_write_pool_count(), sum(|d| d.read_write_pool_count));
    assert_eq!(stats.total_active_session_count(), sum(|d| d.active_session_count));
    assert_eq!(stats.total_in_flight_creation_count(), sum(|d| d.in_flight_creation_count));
    assert_eq!(stats.total_pending_acquisition_count(), sum(|d| d.pending_acquisition_count));
    assert_eq!(stats.total_active_session_count(), held.len() as u32);
    assert_eq!(stats.total_read_write_pool_count(), 4);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["TotalActiveSessionCount"], held.len());
}

#[tokio::test]
async fn test_shutdown_fails_waiters_and_deletes_sessions() {
    let factory = MockSessionFactory::new();
    let pool = Arc::new(pool_with(&factory, PoolConfig::new().max_sessions(2)).await);

    let leased = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();
    let held = pool.acquire(&db(), Capability::ReadOnly).await.unwrap();
    let p = pool.clone();
    let waiter = tokio::spawn(async move { p.acquire(&db(), Capability::ReadOnly).await });
    assert!(eventually(WAIT, || pending(&pool) == 1).await);

    pool.shutdown().await;

    assert!(matches!(waiter.await.unwrap(), Err(PoolError::Shutdown)));
    assert_eq!(factory.live_sessions(), 0);
    assert_eq!(factory.delete_calls(), 2);

    // Releases after shutdown are quiet no-ops.
    drop(leased);
    drop(held);
    assert!(matches!(
        pool.acquire(&db(), Capability::ReadOnly).await,
        Err(PoolError::Shutdown)
    ));
    let stats = pool.statistics();
    assert_eq!(stats.total_read_pool_count(), 0);
    assert_eq!(stats.total_active_session_count(), 0);
}

#[tokio::test]
async fn test_shutdown_swallows_delete_failures() {
    let factory = MockSessionFactory::new();
    factory.fail_deletes(true);
    let pool = pool_with(&factory, PoolConfig::new()).await;
    drop(pool.acquire(&db(), Capability::ReadOnly).await.unwrap());

    pool.shutdown().await;
    pool.shutdown().await;

    assert_eq!(factory.delete_calls(), 1);
    assert!(pool.is_closed());
}
