//! Cross-process wait/notify: classic monitor semantics reproduced over
//! the lock protocol. Waiters release their holds, park, and reacquire
//! them before resuming.

use jicama_api::{LockId, LockLevel, NotifyMode, ThreadId};
use jicama_common::JicamaError;
use jicama_core::WaitOutcome;
use jicama_integration_tests::{TestCluster, settle};

#[tokio::test]
async fn test_wait_notify_reacquires_write_before_returning() {
    let cluster = TestCluster::without_greedy();
    cluster.start().await;
    let a = cluster.join();
    let lock_id = LockId::from("queue");
    let t1 = ThreadId::new(1);
    let t2 = ThreadId::new(2);

    a.locks.lock(&lock_id, t1, LockLevel::Write).await.unwrap();

    let waiting = tokio::spawn({
        let locks = a.locks.clone();
        let lock_id = lock_id.clone();
        async move { locks.wait(&lock_id, t1, None).await }
    });
    settle().await;
    assert!(!waiting.is_finished());

    // The wait released t1's WRITE, so t2 can take it
    a.locks.lock(&lock_id, t2, LockLevel::Write).await.unwrap();
    a.locks.notify(&lock_id, t2, NotifyMode::One).await.unwrap();
    settle().await;
    assert!(
        !waiting.is_finished(),
        "the waiter reacquires WRITE before returning, and t2 still holds it"
    );

    a.locks.unlock(&lock_id, t2).await.unwrap();
    let outcome = waiting.await.unwrap().unwrap();
    assert_eq!(outcome, WaitOutcome::Notified);

    // t1 is a WRITE holder again
    let snapshot = cluster.server.query_lock(&lock_id).await.unwrap();
    assert_eq!(snapshot.holds.len(), 1);
    assert_eq!(snapshot.holds[0].thread_id, t1);
    assert_eq!(snapshot.holds[0].level, LockLevel::Write);
}

#[tokio::test]
async fn test_timed_wait_reacquires_before_reporting_timeout() {
    let cluster = TestCluster::without_greedy();
    cluster.start().await;
    let a = cluster.join();
    let lock_id = LockId::from("queue");
    let t1 = ThreadId::new(1);

    a.locks.lock(&lock_id, t1, LockLevel::Write).await.unwrap();

    let started = jicama_common::now_millis();
    let outcome = a.locks.wait(&lock_id, t1, Some(100)).await.unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);
    assert!(jicama_common::now_millis() - started >= 90);

    // The hold came back with the timeout
    let snapshot = cluster.server.query_lock(&lock_id).await.unwrap();
    assert_eq!(snapshot.holds.len(), 1);
    assert!(snapshot.waiters.is_empty());
    a.locks.unlock(&lock_id, t1).await.unwrap();
}

#[tokio::test]
async fn test_notify_all_wakes_every_waiter() {
    let cluster = TestCluster::without_greedy();
    cluster.start().await;
    let a = cluster.join();
    let b = cluster.join();
    let c = cluster.join();
    let lock_id = LockId::from("barrier");
    let t1 = ThreadId::new(1);

    // Two readers park in wait()
    a.locks.lock(&lock_id, t1, LockLevel::Read).await.unwrap();
    b.locks.lock(&lock_id, t1, LockLevel::Read).await.unwrap();
    let wait_a = tokio::spawn({
        let locks = a.locks.clone();
        let lock_id = lock_id.clone();
        async move { locks.wait(&lock_id, t1, None).await }
    });
    let wait_b = tokio::spawn({
        let locks = b.locks.clone();
        let lock_id = lock_id.clone();
        async move { locks.wait(&lock_id, t1, None).await }
    });
    settle().await;

    let snapshot = cluster.server.query_lock(&lock_id).await.unwrap();
    assert_eq!(snapshot.waiters.len(), 2);

    c.locks.lock(&lock_id, t1, LockLevel::Write).await.unwrap();
    c.locks.notify(&lock_id, t1, NotifyMode::All).await.unwrap();
    settle().await;
    c.locks.unlock(&lock_id, t1).await.unwrap();

    assert_eq!(wait_a.await.unwrap().unwrap(), WaitOutcome::Notified);
    assert_eq!(wait_b.await.unwrap().unwrap(), WaitOutcome::Notified);

    let snapshot = cluster.server.query_lock(&lock_id).await.unwrap();
    assert_eq!(snapshot.holds.len(), 2, "both readers reacquired");
}

#[tokio::test]
async fn test_notify_one_wakes_only_the_first_waiter() {
    let cluster = TestCluster::without_greedy();
    cluster.start().await;
    let a = cluster.join();
    let b = cluster.join();
    let c = cluster.join();
    let lock_id = LockId::from("slot");
    let t1 = ThreadId::new(1);

    a.locks.lock(&lock_id, t1, LockLevel::Read).await.unwrap();
    let wait_a = tokio::spawn({
        let locks = a.locks.clone();
        let lock_id = lock_id.clone();
        async move { locks.wait(&lock_id, t1, None).await }
    });
    settle().await;
    b.locks.lock(&lock_id, t1, LockLevel::Read).await.unwrap();
    let wait_b = tokio::spawn({
        let locks = b.locks.clone();
        let lock_id = lock_id.clone();
        async move { locks.wait(&lock_id, t1, None).await }
    });
    settle().await;

    c.locks.lock(&lock_id, t1, LockLevel::Write).await.unwrap();
    c.locks.notify(&lock_id, t1, NotifyMode::One).await.unwrap();
    settle().await;
    c.locks.unlock(&lock_id, t1).await.unwrap();

    assert_eq!(wait_a.await.unwrap().unwrap(), WaitOutcome::Notified);
    settle().await;
    assert!(!wait_b.is_finished(), "the second waiter stays parked");

    let snapshot = cluster.server.query_lock(&lock_id).await.unwrap();
    assert_eq!(snapshot.waiters.len(), 1);
    wait_b.abort();
}

#[tokio::test]
async fn test_wait_without_hold_is_illegal() {
    let cluster = TestCluster::without_greedy();
    cluster.start().await;
    let a = cluster.join();

    let err = a
        .locks
        .wait(&LockId::from("queue"), ThreadId::new(1), None)
        .await
        .unwrap_err();
    assert!(matches!(err, JicamaError::IllegalMonitorState(_)));
}

#[tokio::test]
async fn test_interrupted_wait_reports_interrupted() {
    let cluster = TestCluster::without_greedy();
    cluster.start().await;
    let a = cluster.join();
    let lock_id = LockId::from("queue");
    let t1 = ThreadId::new(1);

    a.locks.lock(&lock_id, t1, LockLevel::Write).await.unwrap();
    let waiting = tokio::spawn({
        let locks = a.locks.clone();
        let lock_id = lock_id.clone();
        async move { locks.wait(&lock_id, t1, None).await }
    });
    settle().await;

    a.locks.interrupt(&lock_id, t1).await.unwrap();
    let err = waiting.await.unwrap().unwrap_err();
    assert!(matches!(err, JicamaError::Interrupted(_)));

    // The interrupted waiter's node is gone server-side too
    settle().await;
    assert!(cluster.server.query_lock(&lock_id).await.is_none());
}

#[tokio::test]
async fn test_wait_under_greedy_grant_is_recallable() {
    let cluster = TestCluster::new();
    cluster.start().await;
    let a = cluster.join();
    let b = cluster.join();
    let lock_id = LockId::from("queue");
    let t1 = ThreadId::new(1);

    // a holds greedily; the wait still reaches the server, carrying the
    // stashed levels the server cannot see
    a.locks.lock(&lock_id, t1, LockLevel::Write).await.unwrap();
    settle().await;
    assert_eq!(a.locks.greedy_level(&lock_id), Some(LockLevel::Write));

    let waiting = tokio::spawn({
        let locks = a.locks.clone();
        let lock_id = lock_id.clone();
        async move { locks.wait(&lock_id, t1, None).await }
    });
    settle().await;
    let snapshot = cluster.server.query_lock(&lock_id).await.unwrap();
    assert_eq!(snapshot.waiters.len(), 1);
    assert_eq!(snapshot.waiters[0].reacquire, vec![LockLevel::Write]);

    // b can take the lock, notify the waiter, and hand the WRITE back
    b.locks.lock(&lock_id, t1, LockLevel::Write).await.unwrap();
    b.locks.notify(&lock_id, t1, NotifyMode::One).await.unwrap();
    settle().await;
    b.locks.unlock(&lock_id, t1).await.unwrap();
    assert_eq!(waiting.await.unwrap().unwrap(), WaitOutcome::Notified);
}
