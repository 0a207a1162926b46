//! Bounded pool for work detached from the request that triggered it.
//!
//! Jobs are queued on a fixed-capacity channel and drained by a fixed number of
//! workers. Submitting never waits: when the queue is full the job is dropped
//! and counted. Each job runs in its own task so a panic is contained and
//! recorded as a failure.

use futures::future::BoxFuture;
use log::{debug, error, warn};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

struct Job {
    name: &'static str,
    run: BoxFuture<'static, anyhow::Result<()>>,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub submitted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct BackgroundPool {
    tx: mpsc::Sender<Job>,
    counters: Arc<Counters>,
}

impl BackgroundPool {
    /// Starts `workers` drain loops on the current runtime.
    pub fn start(workers: usize, capacity: usize) -> (Self, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel::<Job>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let handles = (0..workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let counters = Arc::clone(&counters);
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut guard = rx.lock().await;
                            guard.recv().await
                        };
                        let Some(job) = job else {
                            debug!("background worker {} stopped", worker);
                            break;
                        };
                        run_job(job, &counters).await;
                    }
                })
            })
            .collect();

        (Self { tx, counters }, handles)
    }

    /// Queues `fut` for execution. Returns false when the queue is full or closed.
    pub fn submit<F>(&self, name: &'static str, fut: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let job = Job {
            name,
            run: Box::pin(fut),
        };
        match self.tx.try_send(job) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Background queue full, dropping job {}", job.name);
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Background pool closed, dropping job {}", job.name);
                false
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

async fn run_job(job: Job, counters: &Counters) {
    let name = job.name;
    match tokio::spawn(job.run).await {
        Ok(Ok(())) => {
            counters.completed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(e)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!("Background job {} failed: {:#}", name, e);
        }
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            error!("Background job {} panicked: {}", name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    async fn wait_for(pool: &BackgroundPool, pred: impl Fn(PoolStats) -> bool) -> PoolStats {
        for _ in 0..200 {
            let stats = pool.stats();
            if pred(stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pool.stats()
    }

    #[tokio::test]
    async fn test_jobs_run_and_failures_are_counted() {
        let (pool, _workers) = BackgroundPool::start(2, 8);
        let (tx, rx) = oneshot::channel();

        assert!(pool.submit("ok", async move {
            let _ = tx.send(7);
            Ok(())
        }));
        assert!(pool.submit("err", async { Err(anyhow::anyhow!("boom")) }));
        assert!(pool.submit("panic", async {
            if true {
                panic!("worker must survive this");
            }
            Ok(())
        }));

        assert_eq!(rx.await.unwrap(), 7);
        let stats = wait_for(&pool, |s| s.completed + s.failed == 3).await;
        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 2);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_blocking() {
        let (pool, _workers) = BackgroundPool::start(1, 1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        pool.submit("blocker", async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok(())
        });
        started_rx.await.unwrap();

        assert!(pool.submit("queued", async { Ok(()) }));
        assert!(!pool.submit("overflow", async { Ok(()) }));
        assert_eq!(pool.stats().rejected, 1);

        release_tx.send(()).unwrap();
        let stats = wait_for(&pool, |s| s.completed == 2).await;
        assert_eq!(stats.completed, 2);
    }
}
