//! Worker pool: competing consumers of the job queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::executor::JobExecutor;
use crate::queue::JobQueue;

/// Pause after a failed dequeue before trying the store again.
const DEQUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub max_workers: usize,
    /// Upper bound on one blocking dequeue; also bounds shutdown latency of
    /// an idle worker.
    pub dequeue_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            dequeue_timeout: Duration::from_secs(5),
        }
    }
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    /// Workers currently executing a job.
    active_workers: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            active_workers: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn the workers.
    ///
    /// Cancellation is only observed between jobs: a worker finishes the job
    /// it holds before it exits.
    pub fn start(&self, queue: Arc<JobQueue>, executor: Arc<JobExecutor>) {
        let dequeue_timeout = self.config.dequeue_timeout;
        info!(
            workers = self.config.max_workers,
            "Starting worker pool"
        );

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            error!("Worker pool already stopped, not starting");
            return;
        };

        for i in 0..self.config.max_workers {
            let cancellation_token = self.cancellation_token.clone();
            let queue = queue.clone();
            let executor = executor.clone();
            let active_workers = self.active_workers.clone();

            join_set.spawn(async move {
                debug!(worker = i, "Worker started");

                loop {
                    if cancellation_token.is_cancelled() {
                        debug!(worker = i, "Worker shutting down");
                        break;
                    }

                    let job_id = match queue.dequeue(dequeue_timeout).await {
                        Ok(Some(job_id)) => job_id,
                        Ok(None) => continue,
                        Err(e) => {
                            error!(worker = i, error = %e, "Error dequeuing job");
                            let cancelled = tokio::select! {
                                _ = cancellation_token.cancelled() => true,
                                _ = tokio::time::sleep(DEQUEUE_ERROR_BACKOFF) => false,
                            };
                            if cancelled {
                                break;
                            }
                            continue;
                        }
                    };

                    active_workers.fetch_add(1, Ordering::SeqCst);
                    debug!(worker = i, job_id = %job_id, "Worker picked up job");
                    executor.execute(&job_id).await;
                    active_workers.fetch_sub(1, Ordering::SeqCst);
                }
            });
        }
    }

    /// Signal the workers and wait for them to finish their current jobs.
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.cancellation_token.cancel();

        let join_set = self.tasks.lock().take();
        if let Some(mut join_set) = join_set {
            while let Some(result) = join_set.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Worker task panicked");
                }
            }
        }

        info!("Worker pool stopped");
    }

    pub fn active_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}
