//! End-to-end lock protocol tests: mutual exclusion, FIFO fairness,
//! reentrancy, bounded acquisition, and interruption

use jicama_api::{LockId, LockLevel, ThreadId};
use jicama_common::JicamaError;
use jicama_integration_tests::{TestCluster, settle};

#[tokio::test]
async fn test_write_lock_is_exclusive_until_released() {
    let cluster = TestCluster::without_greedy();
    cluster.start().await;
    let a = cluster.join();
    let b = cluster.join();
    let lock_id = LockId::from("orders");
    let t1 = ThreadId::new(1);

    a.locks.lock(&lock_id, t1, LockLevel::Write).await.unwrap();

    let b_locks = b.locks.clone();
    let contested = lock_id.clone();
    let b_task = tokio::spawn(async move {
        b_locks.lock(&contested, t1, LockLevel::Write).await.unwrap();
    });
    settle().await;
    assert!(
        !b_task.is_finished(),
        "b must not observe a grant before a's unlock is applied"
    );
    let snapshot = cluster.server.query_lock(&lock_id).await.unwrap();
    assert_eq!(snapshot.holds.len(), 1);
    assert_eq!(snapshot.holds[0].client_id, a.client_id());
    assert_eq!(snapshot.pending.len(), 1);

    a.locks.unlock(&lock_id, t1).await.unwrap();
    b_task.await.unwrap();

    let snapshot = cluster.server.query_lock(&lock_id).await.unwrap();
    assert_eq!(snapshot.holds.len(), 1);
    assert_eq!(snapshot.holds[0].client_id, b.client_id());
}

#[tokio::test]
async fn test_conflicting_requests_are_granted_in_submission_order() {
    let cluster = TestCluster::without_greedy();
    cluster.start().await;
    let a = cluster.join();
    let b = cluster.join();
    let c = cluster.join();
    let lock_id = LockId::from("ledger");
    let t1 = ThreadId::new(1);

    a.locks.lock(&lock_id, t1, LockLevel::Write).await.unwrap();

    let b_locks = b.locks.clone();
    let b_lock_id = lock_id.clone();
    let b_task = tokio::spawn(async move {
        b_locks.lock(&b_lock_id, t1, LockLevel::Write).await.unwrap();
        jicama_common::now_millis()
    });
    settle().await;
    let c_locks = c.locks.clone();
    let c_lock_id = lock_id.clone();
    let c_task = tokio::spawn(async move {
        c_locks.lock(&c_lock_id, t1, LockLevel::Write).await.unwrap();
        jicama_common::now_millis()
    });
    settle().await;

    a.locks.unlock(&lock_id, t1).await.unwrap();
    let b_granted_at = b_task.await.unwrap();
    b.locks.unlock(&lock_id, t1).await.unwrap();
    let c_granted_at = c_task.await.unwrap();

    assert!(
        b_granted_at <= c_granted_at,
        "the earlier conflicting request is granted no later than the later one"
    );
}

#[tokio::test]
async fn test_readers_share_while_writer_waits() {
    let cluster = TestCluster::without_greedy();
    cluster.start().await;
    let a = cluster.join();
    let b = cluster.join();
    let c = cluster.join();
    let lock_id = LockId::from("catalog");
    let t1 = ThreadId::new(1);

    a.locks.lock(&lock_id, t1, LockLevel::Read).await.unwrap();
    b.locks.lock(&lock_id, t1, LockLevel::Read).await.unwrap();

    let c_locks = c.locks.clone();
    let c_lock_id = lock_id.clone();
    let c_task = tokio::spawn(async move {
        c_locks.lock(&c_lock_id, t1, LockLevel::Write).await.unwrap();
    });
    settle().await;
    assert!(!c_task.is_finished(), "the writer waits for both readers");

    a.locks.unlock(&lock_id, t1).await.unwrap();
    settle().await;
    assert!(!c_task.is_finished());
    b.locks.unlock(&lock_id, t1).await.unwrap();
    c_task.await.unwrap();
}

#[tokio::test]
async fn test_reentrant_upgrade_same_owner() {
    let cluster = TestCluster::without_greedy();
    cluster.start().await;
    let a = cluster.join();
    let lock_id = LockId::from("inventory");
    let t1 = ThreadId::new(1);

    a.locks.lock(&lock_id, t1, LockLevel::Write).await.unwrap();
    // WRITE then READ by the same owner must not block
    a.locks.lock(&lock_id, t1, LockLevel::Read).await.unwrap();

    let snapshot = cluster.server.query_lock(&lock_id).await.unwrap();
    assert_eq!(snapshot.holds.len(), 2);

    // Releases pop in LIFO order: the READ goes first, the WRITE stands
    a.locks.unlock(&lock_id, t1).await.unwrap();
    settle().await;
    let snapshot = cluster.server.query_lock(&lock_id).await.unwrap();
    assert_eq!(snapshot.holds.len(), 1);
    assert_eq!(snapshot.holds[0].level, LockLevel::Write);

    a.locks.unlock(&lock_id, t1).await.unwrap();
    settle().await;
    assert!(cluster.server.query_lock(&lock_id).await.is_none());
}

#[tokio::test]
async fn test_try_lock_times_out_with_refused_outcome() {
    let cluster = TestCluster::without_greedy();
    cluster.start().await;
    let a = cluster.join();
    let b = cluster.join();
    let lock_id = LockId::from("jobs");
    let t1 = ThreadId::new(1);

    a.locks.lock(&lock_id, t1, LockLevel::Write).await.unwrap();

    let started = jicama_common::now_millis();
    let acquired = b
        .locks
        .try_lock(&lock_id, t1, LockLevel::Write, 100)
        .await
        .unwrap();
    assert!(!acquired);
    assert!(jicama_common::now_millis() - started >= 90);

    // The refused entry must be gone from the queue
    settle().await;
    let snapshot = cluster.server.query_lock(&lock_id).await.unwrap();
    assert!(snapshot.pending.is_empty());
}

#[tokio::test]
async fn test_try_lock_zero_timeout_fails_fast_without_round_trip() {
    let cluster = TestCluster::without_greedy();
    cluster.start().await;
    let a = cluster.join();
    let b = cluster.join();
    let lock_id = LockId::from("jobs");
    let t1 = ThreadId::new(1);

    a.locks.lock(&lock_id, t1, LockLevel::Write).await.unwrap();

    let before = cluster.router.delivered_count(&b.client_id());
    let acquired = b
        .locks
        .try_lock(&lock_id, t1, LockLevel::Write, 0)
        .await
        .unwrap();
    assert!(!acquired);
    assert_eq!(
        cluster.router.delivered_count(&b.client_id()),
        before,
        "timeout 0 means no blocking network round trip, not block-forever"
    );
}

#[tokio::test]
async fn test_try_lock_succeeds_when_free() {
    let cluster = TestCluster::without_greedy();
    cluster.start().await;
    let a = cluster.join();
    let lock_id = LockId::from("jobs");
    let t1 = ThreadId::new(1);

    let acquired = a
        .locks
        .try_lock(&lock_id, t1, LockLevel::Write, 1_000)
        .await
        .unwrap();
    assert!(acquired);
    a.locks.unlock(&lock_id, t1).await.unwrap();
}

#[tokio::test]
async fn test_interrupt_unblocks_with_interrupted_outcome() {
    let cluster = TestCluster::without_greedy();
    cluster.start().await;
    let a = cluster.join();
    let b = cluster.join();
    let lock_id = LockId::from("batch");
    let t1 = ThreadId::new(1);

    a.locks.lock(&lock_id, t1, LockLevel::Write).await.unwrap();

    let b_locks = b.locks.clone();
    let b_lock_id = lock_id.clone();
    let b_task = tokio::spawn(async move { b_locks.lock(&b_lock_id, t1, LockLevel::Write).await });
    settle().await;

    b.locks.interrupt(&lock_id, t1).await.unwrap();
    let err = b_task.await.unwrap().unwrap_err();
    assert!(matches!(err, JicamaError::Interrupted(_)));

    // b's queue position is gone; releasing leaves the lock empty
    settle().await;
    a.locks.unlock(&lock_id, t1).await.unwrap();
    settle().await;
    assert!(cluster.server.query_lock(&lock_id).await.is_none());
}

#[tokio::test]
async fn test_operations_on_distinct_locks_do_not_interfere() {
    let cluster = TestCluster::without_greedy();
    cluster.start().await;
    let a = cluster.join();
    let b = cluster.join();
    let t1 = ThreadId::new(1);

    a.locks
        .lock(&LockId::from("left"), t1, LockLevel::Write)
        .await
        .unwrap();
    // A write hold on "left" must not block "right"
    b.locks
        .lock(&LockId::from("right"), t1, LockLevel::Write)
        .await
        .unwrap();

    let dump = cluster.server.dump().await;
    assert_eq!(dump.len(), 2);
    assert!(dump.iter().all(|s| s.holds.len() == 1));
}
