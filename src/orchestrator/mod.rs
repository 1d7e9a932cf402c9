//! End-to-end run driver.
//!
//! A run goes through these phases, in order:
//!
//! ```text
//! validate ─▶ partition ─▶ reconcile ─▶ pull ─▶ provision ─▶ dispatch ─▶ teardown ─▶ reduce
//!                                                   │                        ▲
//!                                                   └──── always paired ─────┘
//! ```
//!
//! Setup failures abort before any task starts. Stage failures are scoped to
//! their task; they are collected while every other task keeps running and
//! the first one becomes the run's error. Shared resources are torn down
//! once dispatch returns, whatever its outcome.
//!
//! Ctrl-C is watched for the whole run. During dispatch it stops queued
//! tasks from starting; teardown still completes, and reduction is skipped.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::error::{ReconcileError, RunError};
use crate::execution::{run_labels, ContainerRuntime};
use crate::partition::{count_units, discover_tasks, split_input, TaskUnit};
use crate::pipeline::state;
use crate::pipeline::{StageContext, TaskRunner, Tool, ToolDefinition};
use crate::progress::{self, RunReport};
use crate::provision::{provision, pull_images};
use crate::reconcile::{ReconcileReport, Reconciler, ResourceRegistry};
use crate::reduce::{reduce, ReduceReport};
use crate::scheduler::{PoolStats, WorkerPool, WorkerPoolConfig};

/// Everything a successful run did.
#[derive(Debug)]
pub struct RunSummary {
    pub run_id: String,
    /// Task units written by the partition phase; zero when it was skipped.
    pub partitioned: usize,
    /// Task units skipped because an earlier run finished them.
    pub resumed: usize,
    pub reconciled: ReconcileReport,
    pub pool: PoolStats,
    pub report: RunReport,
    pub reduced: ReduceReport,
}

/// What a run would do, computed without side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub tool: Tool,
    /// Task units the run would dispatch.
    pub tasks: usize,
    pub stages: Vec<String>,
    pub images: Vec<String>,
    pub networks: Vec<String>,
    pub services: Vec<String>,
}

/// Ctrl-C watcher that lives as long as the run.
struct Interrupts {
    rx: watch::Receiver<bool>,
    listener: Option<JoinHandle<()>>,
}

impl Interrupts {
    fn listen() -> Self {
        let (tx, rx) = watch::channel(false);
        let listener = tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if tx.send_replace(true) {
                    warn!("Interrupt received again, the run stops after teardown");
                } else {
                    warn!("Interrupt received, letting running tasks finish");
                }
            }
        });
        Self {
            rx,
            listener: Some(listener),
        }
    }

    fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once an interrupt arrives; never resolves without a listener.
    async fn wait(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|interrupted| *interrupted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for Interrupts {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

/// Turns the pool and aggregator outcome into the run's verdict.
///
/// Every failed task reports exactly one hard error; a failed task without
/// one ended abnormally and is counted as aborted.
fn settle(pool: &PoolStats, report: RunReport, interrupted: bool) -> Result<RunReport, RunError> {
    if pool.tasks_skipped > 0 || interrupted {
        return Err(RunError::Interrupted {
            skipped: pool.tasks_skipped,
        });
    }

    let unreported = pool
        .tasks_failed
        .saturating_sub(report.errors.len() as u64);
    if unreported > 0 {
        return Err(RunError::TasksAborted { count: unreported });
    }

    report.into_result()
}

/// Drives runs of one tool over one working directory.
pub struct Orchestrator {
    config: RunConfig,
    runtime: Arc<dyn ContainerRuntime>,
    definition: ToolDefinition,
}

struct Dispatch {
    resumed: usize,
    pool: PoolStats,
    report: RunReport,
}

impl Orchestrator {
    pub fn new(config: RunConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let definition = config.tool.definition();
        Self {
            config,
            runtime,
            definition,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs every phase of the pipeline.
    pub async fn run(&self) -> Result<RunSummary, RunError> {
        self.config.validate()?;
        self.run_with(Interrupts::listen()).await
    }

    /// Describes the run without touching the file system or the runtime.
    pub fn plan(&self) -> Result<RunPlan, RunError> {
        self.config.validate()?;

        let tasks = if self.definition.partitioned && !self.config.resume {
            count_units(&self.config.input, self.config.lines_per_task)?
        } else {
            discover_tasks(&self.config.task_root())?
                .iter()
                .filter(|task| !self.config.resume || !state::current(task).is_finished())
                .count()
        };

        Ok(RunPlan {
            tool: self.config.tool,
            tasks,
            stages: self.definition.stages.iter().map(|s| s.name.clone()).collect(),
            images: self.definition.images(),
            networks: self.definition.network_names(),
            services: self.definition.service_names(),
        })
    }

    async fn run_with(&self, interrupts: Interrupts) -> Result<RunSummary, RunError> {
        let run_id = Uuid::new_v4().to_string();
        let tool = self.config.tool;
        let started = Instant::now();
        info!(
            run_id = %run_id,
            tool = %tool,
            workdir = %self.config.workdir.display(),
            workers = self.config.workers,
            resume = self.config.resume,
            "Starting run"
        );

        let partitioned = if self.definition.partitioned && !self.config.resume {
            self.split().await?.len()
        } else {
            0
        };

        let mut registry = self.open_registry()?;
        let reconciled = self.reconcile(&mut registry).await?;
        registry
            .begin_run(&run_id)
            .map_err(|e| ReconcileError::Registry(e.to_string()))?;

        if self.config.pull_images {
            pull_images(self.runtime.as_ref(), &self.definition.images()).await?;
        }

        let mut provisioned = provision(
            self.runtime.as_ref(),
            &self.definition.networks,
            &self.config.readiness,
            &run_labels(tool.name(), &run_id),
            &mut registry,
        )
        .await?;

        let dispatched = self.dispatch(&run_id, &interrupts).await;

        let leftovers = provisioned.teardown(self.runtime.as_ref(), &mut registry).await;
        if leftovers > 0 {
            warn!(
                count = leftovers,
                "Some shared resources could not be removed; the next run will reconcile them"
            );
        }

        let Dispatch {
            resumed,
            pool,
            report,
        } = dispatched?;

        let report = settle(&pool, report, interrupts.is_set()).map_err(|e| {
            error!(run_id = %run_id, error = %e, "Run did not complete");
            e
        })?;

        let reduced = tokio::select! {
            reduced = self.reduce() => reduced?,
            _ = interrupts.wait() => {
                warn!(run_id = %run_id, "Interrupted during reduction");
                return Err(RunError::Interrupted { skipped: 0 });
            }
        };

        info!(
            run_id = %run_id,
            tasks = report.dispatched,
            resumed = resumed,
            warnings = report.warnings,
            outputs = reduced.outputs.len(),
            elapsed = ?started.elapsed(),
            "Run completed"
        );

        Ok(RunSummary {
            run_id,
            partitioned,
            resumed,
            reconciled,
            pool,
            report,
            reduced,
        })
    }

    /// Splits the input document into task units.
    pub async fn split(&self) -> Result<Vec<TaskUnit>, RunError> {
        let input = self.config.input.clone();
        let workdir = self.config.workdir.clone();
        let tool = self.config.tool;
        let lines = self.config.lines_per_task;

        let units =
            tokio::task::spawn_blocking(move || split_input(&input, &workdir, tool.name(), lines))
                .await??;
        Ok(units)
    }

    /// Removes resources left over by earlier runs of the tool.
    pub async fn cleanup(&self) -> Result<ReconcileReport, RunError> {
        let mut registry = self.open_registry()?;
        self.reconcile(&mut registry).await
    }

    /// Reduces the task units into collection-level outputs.
    pub async fn reduce(&self) -> Result<ReduceReport, RunError> {
        let workdir = self.config.workdir.clone();
        let output_dir = self.config.output_dir.clone();
        let collection = self.config.collection.clone();
        let definition = self.definition.clone();

        let reduced = tokio::task::spawn_blocking(move || {
            reduce(&workdir, &output_dir, &definition, &collection)
        })
        .await??;
        Ok(reduced)
    }

    fn open_registry(&self) -> Result<ResourceRegistry, RunError> {
        ResourceRegistry::open(&self.config.workdir, self.config.tool.name())
            .map_err(|e| ReconcileError::Registry(e.to_string()).into())
    }

    async fn reconcile(&self, registry: &mut ResourceRegistry) -> Result<ReconcileReport, RunError> {
        let reconciler = Reconciler::new(
            &self.definition.container_patterns(),
            &self.definition.network_names(),
        )?;
        Ok(reconciler.run(self.runtime.as_ref(), registry).await?)
    }

    /// Runs the stage chain over every pending task unit.
    async fn dispatch(&self, run_id: &str, interrupts: &Interrupts) -> Result<Dispatch, RunError> {
        let task_root = self.config.task_root();
        let mut tasks = discover_tasks(&task_root)?;
        let discovered = tasks.len();
        if self.config.resume {
            tasks.retain(|task| !state::current(task).is_finished());
        }
        let resumed = discovered - tasks.len();
        if resumed > 0 {
            info!(resumed = resumed, pending = tasks.len(), "Skipping tasks finished by an earlier run");
        }

        let pool = WorkerPool::new(WorkerPoolConfig::new(self.config.workers))?;

        let (events, aggregator) = progress::channel(
            tasks.len(),
            self.definition.stage_count(),
            self.config.show_progress,
        );
        let listener = aggregator.spawn();

        let ctx = StageContext::new(Arc::clone(&self.runtime), self.config.tool, run_id)
            .with_timeout(self.config.stage_timeout)
            .with_database(self.config.database.clone());
        let runner = Arc::new(TaskRunner::new(
            Arc::new(ctx),
            self.definition.stages.clone(),
            events.clone(),
        ));

        let shutdown = pool.shutdown_handle();
        let run = pool.run_all(tasks, runner);
        tokio::pin!(run);
        // Polling the pool first subscribes its workers before any signal is sent.
        let stats = tokio::select! {
            biased;
            stats = &mut run => stats,
            _ = interrupts.wait() => {
                let _ = shutdown.send(());
                run.await
            }
        };

        events.finish();
        let report = listener.await?;

        Ok(Dispatch {
            resumed,
            pool: stats,
            report,
        })
    }
}
