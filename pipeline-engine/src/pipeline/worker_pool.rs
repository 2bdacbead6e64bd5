//! Worker pool running the orchestrator loop.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::orchestrator::Orchestrator;
use crate::queue::PriorityQueue;

/// Upper bound on the back-off after consecutive queue errors.
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Configuration for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// How long a single dequeue blocks before re-checking for shutdown.
    #[serde(default = "default_dequeue_timeout_ms")]
    pub dequeue_timeout_ms: u64,
    /// Per-stage timeout in seconds. 0 disables it.
    #[serde(default)]
    pub stage_timeout_secs: u64,
}

fn default_max_workers() -> usize {
    4
}

fn default_dequeue_timeout_ms() -> u64 {
    1000
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            dequeue_timeout_ms: default_dequeue_timeout_ms(),
            stage_timeout_secs: 0,
        }
    }
}

impl WorkerPoolConfig {
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms.max(1))
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        (self.stage_timeout_secs > 0).then(|| Duration::from_secs(self.stage_timeout_secs))
    }
}

/// A fixed set of workers, each dequeuing and processing one job at a time.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    /// Workers currently running a pipeline.
    active_workers: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::with_config(WorkerPoolConfig::default())
    }

    pub fn with_config(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            active_workers: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Spawn `max_workers` workers. Calling it after [`WorkerPool::stop`] does nothing.
    pub fn start(&self, queue: Arc<PriorityQueue>, orchestrator: Arc<Orchestrator>) {
        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            debug!("Worker pool already stopped; not starting workers");
            return;
        };

        info!("Starting worker pool with {} workers", self.config.max_workers);

        for worker in 0..self.config.max_workers {
            join_set.spawn(run_worker(
                worker,
                queue.clone(),
                orchestrator.clone(),
                self.cancellation_token.clone(),
                self.active_workers.clone(),
                self.config.dequeue_timeout(),
            ));
        }
    }

    /// Signal shutdown and wait for every worker to finish its current pipeline.
    pub async fn stop(&self) {
        info!("Stopping worker pool");
        self.cancellation_token.cancel();

        // Take the join set out of the mutex before awaiting
        let join_set = self.tasks.lock().take();

        if let Some(mut join_set) = join_set {
            while let Some(joined) = join_set.join_next().await {
                if let Err(e) = joined {
                    error!("Worker task ended abnormally: {}", e);
                }
            }
        }

        info!("Worker pool stopped");
    }

    /// Number of workers currently running a pipeline.
    pub fn active_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_worker(
    worker: usize,
    queue: Arc<PriorityQueue>,
    orchestrator: Arc<Orchestrator>,
    token: CancellationToken,
    active_workers: Arc<AtomicUsize>,
    dequeue_timeout: Duration,
) {
    debug!(worker, "Worker started");
    let mut consecutive_errors: u32 = 0;

    loop {
        // Popping is synchronous inside the broker, so dropping a pending
        // dequeue never loses a reference.
        let dequeued = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            dequeued = queue.dequeue(dequeue_timeout) => dequeued,
        };

        let job = match dequeued {
            Ok(Some(job)) => {
                consecutive_errors = 0;
                job
            }
            Ok(None) => {
                consecutive_errors = 0;
                continue;
            }
            Err(e) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                let delay = error_backoff(consecutive_errors);
                error!(
                    worker,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Failed to dequeue job"
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        active_workers.fetch_add(1, Ordering::SeqCst);
        debug!(
            worker,
            job_id = %job.job_id,
            pipeline_id = %job.pipeline_id,
            priority = %job.priority,
            "Worker picked up job"
        );
        let outcome = orchestrator.process(&job).await;
        active_workers.fetch_sub(1, Ordering::SeqCst);
        debug!(worker, job_id = %job.job_id, ?outcome, "Worker finished job");
    }

    debug!(worker, "Worker shutting down");
}

fn error_backoff(consecutive_errors: u32) -> Duration {
    let exp = consecutive_errors.saturating_sub(1).min(10);
    Duration::from_millis(100u64.saturating_mul(1 << exp)).min(MAX_ERROR_BACKOFF)
}
