use futures::future::BoxFuture;
use futures::FutureExt;
use log::{error, info, warn};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Clears the running flag however the run ends, including when its future is dropped.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type JobFn = dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    /// A previous run of the same job was still in progress.
    Skipped,
}

/// A job fired on a fixed interval. Two runs of the same job never overlap.
#[derive(Clone)]
pub struct IntervalJob {
    name: &'static str,
    every: Duration,
    running: Arc<AtomicBool>,
    task: Arc<JobFn>,
}

impl IntervalJob {
    pub fn new<F, Fut>(name: &'static str, every: Duration, task: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name,
            every,
            running: Arc::new(AtomicBool::new(false)),
            task: Arc::new(move || Box::pin(task())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn run_once(&self) -> RunOutcome {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("Scheduled job {} still running, skipping this tick", self.name);
            return RunOutcome::Skipped;
        }
        let _guard = RunningGuard(&self.running);
        match AssertUnwindSafe((self.task)()).catch_unwind().await {
            Ok(Ok(())) => RunOutcome::Completed,
            Ok(Err(e)) => {
                error!("Scheduled job {} failed: {:#}", self.name, e);
                RunOutcome::Failed
            }
            Err(_) => {
                error!("Scheduled job {} panicked", self.name);
                RunOutcome::Failed
            }
        }
    }

    /// Runs the job every interval until `shutdown` fires. The first run happens
    /// one full interval after start.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Starting scheduled job {} every {:?}", self.name, self.every);
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + self.every, self.every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        self.run_once().await;
                    }
                }
            }
            info!("Scheduled job {} stopped", self.name);
        })
    }
}
