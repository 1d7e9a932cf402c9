//! Fixed-size worker pool over a shared task queue.
//!
//! `run_all` fills the queue with every task unit, spawns the configured
//! number of workers and returns once the queue is drained and every worker
//! has finished its current task. Each worker runs one task at a time, so at
//! most `num_workers` tasks execute concurrently whatever the task count.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel (in-flight tasks finish, queued tasks are skipped)
//! - Panics inside a task are contained and counted as failures
//! - Pool statistics tracking

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::partition::TaskUnit;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool was configured without workers.
    #[error("Worker pool needs at least one worker")]
    NoWorkers,
}

/// Work performed for each task unit.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Processes one task. Returns true on success.
    async fn handle(&self, task: TaskUnit) -> bool;
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self { num_workers }
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Tasks handed to the pool.
    pub submitted: u64,
    /// Tasks that finished successfully.
    pub tasks_completed: u64,
    /// Tasks that failed or panicked.
    pub tasks_failed: u64,
    /// Tasks left in the queue after a shutdown.
    pub tasks_skipped: u64,
    /// Highest number of tasks observed running at once.
    pub peak_active: u64,
    /// Average task processing duration.
    pub average_task_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of tasks processed (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.tasks_completed + self.tasks_failed
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active: AtomicU64,
    peak_active: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active: AtomicU64::new(0),
            peak_active: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.tasks_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize, submitted: u64, skipped: u64) -> PoolStats {
        let completed = self.tasks_completed.load(Ordering::SeqCst);
        let failed = self.tasks_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total = completed + failed;
        let average = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            submitted,
            tasks_completed: completed,
            tasks_failed: failed,
            tasks_skipped: skipped,
            peak_active: self.peak_active.load(Ordering::SeqCst),
            average_task_duration: average,
        }
    }
}

/// First-in first-out queue of pending task units.
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: Mutex<VecDeque<TaskUnit>>,
}

impl TaskQueue {
    pub fn new(tasks: impl IntoIterator<Item = TaskUnit>) -> Self {
        Self {
            inner: Mutex::new(tasks.into_iter().collect()),
        }
    }

    /// Takes the next task, if any.
    pub fn pop(&self) -> Option<TaskUnit> {
        match self.inner.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(queue) => queue.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Worker pool running task units with bounded parallelism.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    shutdown_tx: broadcast::Sender<()>,
    stats: Arc<SharedPoolStats>,
}

impl WorkerPool {
    /// Creates a new worker pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NoWorkers` if `num_workers` is zero.
    pub fn new(config: WorkerPoolConfig) -> Result<Self, PoolError> {
        if config.num_workers == 0 {
            return Err(PoolError::NoWorkers);
        }

        // One slot: shutdown is signalled at most once.
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            shutdown_tx,
            stats: Arc::new(SharedPoolStats::new()),
        })
    }

    /// Handle used to stop the pool from dispatching further tasks.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Runs every task through `handler` and waits for all of them.
    pub async fn run_all(&self, tasks: Vec<TaskUnit>, handler: Arc<dyn TaskHandler>) -> PoolStats {
        let submitted = tasks.len() as u64;
        let queue = Arc::new(TaskQueue::new(tasks));
        let num_workers = self.config.num_workers.min(queue.len());

        info!(
            num_workers = num_workers,
            tasks = submitted,
            "Worker pool started"
        );

        let handles: Vec<_> = (0..num_workers)
            .map(|i| {
                let worker = Worker {
                    id: format!("worker-{i}"),
                    queue: Arc::clone(&queue),
                    handler: Arc::clone(&handler),
                    shutdown_rx: self.shutdown_tx.subscribe(),
                    stats: Arc::clone(&self.stats),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }

        let skipped = queue.len() as u64;
        if skipped > 0 {
            warn!(skipped = skipped, "Worker pool stopped with tasks still queued");
        }

        let stats = self.stats(submitted, skipped);
        info!(
            completed = stats.tasks_completed,
            failed = stats.tasks_failed,
            "Worker pool drained"
        );
        stats
    }

    fn stats(&self, submitted: u64, skipped: u64) -> PoolStats {
        self.stats
            .to_pool_stats(self.config.num_workers, submitted, skipped)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// A single worker that processes tasks from the queue.
struct Worker {
    id: String,
    queue: Arc<TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    /// Takes tasks until the queue is empty or shutdown is signalled.
    async fn run(mut self) {
        debug!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Closed)
                | Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let Some(task) = self.queue.pop() else {
                break;
            };
            self.process(task).await;
        }

        debug!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&self, task: TaskUnit) {
        let name = task.name.clone();
        debug!(worker_id = %self.id, task = %name, "Processing task");

        self.stats.increment_active();
        let start = Instant::now();

        let handler = Arc::clone(&self.handler);
        let result = tokio::spawn(async move { handler.handle(task).await }).await;

        let duration = start.elapsed();
        match result {
            Ok(true) => self.stats.record_completion(duration),
            Ok(false) => self.stats.record_failure(duration),
            Err(e) => {
                error!(worker_id = %self.id, task = %name, error = %e, "Task panicked");
                self.stats.record_failure(duration);
            }
        }
        self.stats.decrement_active();
    }
}
