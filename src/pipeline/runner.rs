//! Multi-stage task runner.
//!
//! Drives one task unit through its tool's stage chain, strictly in order.
//! The first hard failure ends the chain for that task only; artifacts of
//! earlier stages are left in place.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::StageError;
use crate::partition::TaskUnit;
use crate::pipeline::stage::{run_stage, StageContext, StageDescriptor, StageStatus};
use crate::pipeline::state::{self, TaskState};
use crate::progress::{EventSender, Outcome, StageEvent};
use crate::scheduler::TaskHandler;

/// Runs every stage of `task` in order.
///
/// A [`StageEvent`] is emitted for each stage that completes, successfully or
/// with a soft warning. The failing stage, if any, is returned rather than
/// emitted so the caller decides how to report it.
pub async fn run_task(
    ctx: &StageContext,
    stages: &[StageDescriptor],
    task: &TaskUnit,
    events: &EventSender,
) -> Result<(), StageError> {
    for stage in stages {
        state::record(
            task,
            &ctx.run_id,
            TaskState::Running {
                stage: stage.name.clone(),
            },
        );

        match run_stage(ctx, stage, task).await {
            Ok(StageStatus::Produced) => {
                debug!(task = %task.name, stage = %stage.name, "Stage completed");
                events.emit(StageEvent::new(&task.name, &stage.name, Outcome::Success));
            }
            Ok(StageStatus::Empty(path)) => {
                events.emit(StageEvent::new(
                    &task.name,
                    &stage.name,
                    Outcome::SoftWarning(format!("{} is empty", path.display())),
                ));
            }
            Err(err) => {
                state::record(
                    task,
                    &ctx.run_id,
                    TaskState::Failed {
                        stage: stage.name.clone(),
                        error: err.to_string(),
                    },
                );
                return Err(err);
            }
        }

        state::record(
            task,
            &ctx.run_id,
            TaskState::StageDone {
                stage: stage.name.clone(),
            },
        );
    }

    state::record(task, &ctx.run_id, TaskState::Completed);
    Ok(())
}

/// Scheduler handler running a tool's stage chain over each task unit.
pub struct TaskRunner {
    ctx: Arc<StageContext>,
    stages: Arc<Vec<StageDescriptor>>,
    events: EventSender,
}

impl TaskRunner {
    pub fn new(ctx: Arc<StageContext>, stages: Vec<StageDescriptor>, events: EventSender) -> Self {
        Self {
            ctx,
            stages: Arc::new(stages),
            events,
        }
    }
}

#[async_trait]
impl TaskHandler for TaskRunner {
    async fn handle(&self, task: TaskUnit) -> bool {
        match run_task(&self.ctx, &self.stages, &task, &self.events).await {
            Ok(()) => {
                info!(task = %task.name, "Task completed");
                true
            }
            Err(err) => {
                let stage = err.stage().to_string();
                self.events
                    .emit(StageEvent::new(&task.name, &stage, Outcome::HardError(err)));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::execution::MemoryRuntime;
    use crate::pipeline::stage::BindSpec;
    use crate::pipeline::tools::Tool;
    use crate::progress;

    fn two_stage_chain() -> Vec<StageDescriptor> {
        vec![
            StageDescriptor::soft("compute", "itextmine/mirtex", "output.json").with_binds(vec![
                BindSpec::input("input.json", "/w/in.json").read_only(),
                BindSpec::output("output.json", "/w/out.json"),
            ]),
            StageDescriptor::soft("align", "itextmine/align", "align.json").with_binds(vec![
                BindSpec::input("input.json", "/a/origin.json").read_only(),
                BindSpec::input("output.json", "/a/result.json").read_only(),
                BindSpec::output("align.json", "/a/out.json"),
            ]),
        ]
    }

    fn task(root: &Path, index: usize) -> TaskUnit {
        let task = TaskUnit::new(root, index);
        fs::create_dir_all(&task.dir).expect("mkdir");
        fs::write(task.artifact("input.json"), "{}\n").expect("write");
        task
    }

    #[tokio::test]
    async fn test_full_chain_completes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let unit = task(dir.path(), 0);
        let runtime = Arc::new(MemoryRuntime::new());
        let ctx = StageContext::new(runtime.clone(), Tool::Mirtex, "run-1");
        let (events, aggregator) = progress::channel(1, 2, false);

        run_task(&ctx, &two_stage_chain(), &unit, &events)
            .await
            .expect("task");
        events.finish();
        let report = aggregator.run().await;

        assert_eq!(report.progress, 2);
        assert_eq!(state::current(&unit), TaskState::Completed);
        assert_eq!(
            fs::read_to_string(unit.artifact("align.json")).expect("read"),
            "mirtex-align-task_0\n"
        );
    }

    #[tokio::test]
    async fn test_hard_failure_skips_remaining_stages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let unit = task(dir.path(), 1);
        let runtime = Arc::new(MemoryRuntime::new());
        runtime.fail_start("mirtex-compute-task_1");
        let ctx = Arc::new(StageContext::new(runtime.clone(), Tool::Mirtex, "run-1"));
        let (events, aggregator) = progress::channel(1, 2, false);

        let runner = TaskRunner::new(ctx, two_stage_chain(), events.clone());
        assert!(!runner.handle(unit.clone()).await);
        events.finish();
        let report = aggregator.run().await;

        assert_eq!(report.progress, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].stage(), "compute");
        assert_eq!(runtime.created_names(), vec!["mirtex-compute-task_1".to_string()]);
        assert!(matches!(state::current(&unit), TaskState::Failed { .. }));
    }

    #[tokio::test]
    async fn test_soft_empty_continues_to_align() {
        let dir = tempfile::tempdir().expect("tempdir");
        let unit = task(dir.path(), 2);
        let runtime = Arc::new(MemoryRuntime::new());
        runtime.produce_empty_output("mirtex-compute-task_2");
        let ctx = StageContext::new(runtime.clone(), Tool::Mirtex, "run-1");
        let (events, aggregator) = progress::channel(1, 2, false);

        run_task(&ctx, &two_stage_chain(), &unit, &events)
            .await
            .expect("task");
        events.finish();
        let report = aggregator.run().await;

        assert!(report.errors.is_empty());
        assert_eq!(report.warnings, 1);
        assert_eq!(report.successes, 1);
        assert!(runtime
            .created_names()
            .contains(&"mirtex-align-task_2".to_string()));
    }
}
