//! Bounded worker pool - N tasks draining one shared queue

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::core::config::OverflowPolicy;
use crate::core::{Error, Result};

pub type Job = BoxFuture<'static, ()>;

#[derive(Default)]
struct PoolStats {
    active: AtomicUsize,
    completed: AtomicU64,
    panicked: AtomicU64,
}

pub struct WorkerPool {
    sender: Mutex<Option<flume::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<PoolStats>,
    size: usize,
    depth: usize,
    overflow: OverflowPolicy,
}

impl WorkerPool {
    /// Spawn `size` workers behind a queue of `depth`. Requires a tokio runtime.
    pub fn new(size: usize, depth: usize, overflow: OverflowPolicy) -> Self {
        let size = size.max(1);
        let depth = depth.max(1);
        let (tx, rx) = flume::bounded::<Job>(depth);
        let stats = Arc::new(PoolStats::default());

        let workers = (0..size)
            .map(|id| {
                let rx = rx.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    while let Ok(job) = rx.recv_async().await {
                        stats.active.fetch_add(1, Ordering::AcqRel);
                        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                            stats.panicked.fetch_add(1, Ordering::Relaxed);
                            error!("Worker {} recovered from a panicking job", id);
                        }
                        stats.active.fetch_sub(1, Ordering::AcqRel);
                        stats.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!("Worker {} exiting", id);
                })
            })
            .collect();

        info!("Worker pool started: {} workers, queue depth {}, overflow {:?}", size, depth, overflow);
        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            stats,
            size,
            depth,
            overflow,
        }
    }

    /// Queue a task. Past queue depth: waits (`Block`) or fails with `QueueFull` (`Reject`).
    pub async fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = self
            .sender
            .lock()
            .clone()
            .ok_or(Error::ChannelClosed("worker pool"))?;
        let job: Job = Box::pin(task);

        match self.overflow {
            OverflowPolicy::Block => tx
                .send_async(job)
                .await
                .map_err(|_| Error::ChannelClosed("worker pool")),
            OverflowPolicy::Reject => tx.try_send(job).map_err(|e| match e {
                flume::TrySendError::Full(_) => Error::QueueFull(self.depth),
                flume::TrySendError::Disconnected(_) => Error::ChannelClosed("worker pool"),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn queued(&self) -> usize {
        self.sender.lock().as_ref().map(|tx| tx.len()).unwrap_or(0)
    }

    pub fn active(&self) -> usize {
        self.stats.active.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u64 {
        self.stats.completed.load(Ordering::Relaxed)
    }

    /// Stop accepting work, run everything already queued, then join workers
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
        info!("Worker pool stopped after {} jobs", self.completed());
    }
}
