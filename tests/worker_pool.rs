use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use aleph_oms::core::config::OverflowPolicy;
use aleph_oms::execution::WorkerPool;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_three_workers_bound_five_tasks() {
    let pool = WorkerPool::new(3, 8, OverflowPolicy::Block);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = flume::unbounded();

    for _ in 0..5 {
        let (running, peak, done_tx) = (running.clone(), peak.clone(), done_tx.clone());
        pool.submit(async move {
            let now = running.fetch_add(1, Ordering::AcqRel) + 1;
            peak.fetch_max(now, Ordering::AcqRel);
            tokio::time::sleep(Duration::from_millis(30)).await;
            running.fetch_sub(1, Ordering::AcqRel);
            let _ = done_tx.send(());
        })
        .await
        .unwrap();
    }

    let all = tokio::time::timeout(Duration::from_secs(2), async {
        for _ in 0..5 {
            done_rx.recv_async().await.unwrap();
        }
    })
    .await;
    assert!(all.is_ok(), "tasks did not finish in time");
    assert!(peak.load(Ordering::Acquire) <= 3);
    assert!(peak.load(Ordering::Acquire) >= 2);

    pool.shutdown().await;
    assert_eq!(pool.completed(), 5);
}

#[tokio::test]
async fn test_panicking_task_does_not_kill_worker() {
    let pool = WorkerPool::new(1, 4, OverflowPolicy::Block);
    pool.submit(async { panic!("boom") }).await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    pool.submit(async move {
        let _ = tx.send(42);
    })
    .await
    .unwrap();

    assert_eq!(rx.await.unwrap(), 42);
    pool.shutdown().await;
}
