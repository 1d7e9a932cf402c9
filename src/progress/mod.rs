//! Progress and error aggregation for a run.
//!
//! Task runners report one [`StageEvent`] per attempted stage over a single
//! channel. The channel is sized for the largest possible number of events
//! (tasks × stages per task, plus the end-of-run marker), so producers send
//! with `try_send` and never wait. A [`ProgressAggregator`] drains the
//! channel for the life of the run, drives the progress bar and collects
//! every hard error into a [`RunReport`].
//!
//! # Example
//!
//! ```rust,ignore
//! let (events, aggregator) = progress::channel(tasks.len(), def.stage_count(), true);
//! let listener = aggregator.spawn();
//! // ... run tasks, each emitting through `events` ...
//! events.finish();
//! let report = listener.await?;
//! ```

use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{RunError, StageError};

/// What happened to one attempted stage.
#[derive(Debug)]
pub enum Outcome {
    Success,
    /// A soft stage produced nothing.
    SoftWarning(String),
    HardError(StageError),
}

/// Completion signal of one stage of one task.
#[derive(Debug)]
pub struct StageEvent {
    pub task: String,
    pub stage: String,
    pub outcome: Outcome,
}

impl StageEvent {
    pub fn new(task: &str, stage: &str, outcome: Outcome) -> Self {
        Self {
            task: task.to_string(),
            stage: stage.to_string(),
            outcome,
        }
    }
}

#[derive(Debug)]
enum Message {
    Stage(StageEvent),
    Finished,
}

/// Producer side of the event channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Message>,
}

impl EventSender {
    /// Reports a stage outcome without waiting.
    pub fn emit(&self, event: StageEvent) {
        match self.tx.try_send(Message::Stage(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(Message::Stage(event))) => {
                error!(task = %event.task, stage = %event.stage, "Progress channel full, event dropped");
            }
            Err(TrySendError::Full(Message::Finished)) => {}
            Err(TrySendError::Closed(_)) => {
                warn!("Progress listener gone, event dropped");
            }
        }
    }

    /// Signals the end of the run. Every event sent before is still drained.
    pub fn finish(&self) {
        if let Err(e) = self.tx.try_send(Message::Finished) {
            warn!(error = %e, "Failed to signal end of run to progress listener");
        }
    }
}

/// Aggregate outcome of a run.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Task units handed to the scheduler.
    pub dispatched: usize,
    /// Stage events observed; one per attempted stage.
    pub progress: usize,
    pub successes: usize,
    pub warnings: usize,
    /// Every hard failure, in arrival order.
    pub errors: Vec<StageError>,
    pub elapsed: Duration,
}

impl RunReport {
    /// Number of failures that were deadline expiries.
    pub fn timeouts(&self) -> usize {
        self.errors.iter().filter(|e| e.is_timeout()).count()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Turns collected errors into a run failure carrying the first one.
    pub fn into_result(mut self) -> Result<Self, RunError> {
        if self.errors.is_empty() {
            return Ok(self);
        }
        let total = self.errors.len();
        let first = self.errors.remove(0);
        Err(RunError::TasksFailed { first, total })
    }
}

/// Consumer side of the event channel.
pub struct ProgressAggregator {
    rx: mpsc::Receiver<Message>,
    dispatched: usize,
    bar: ProgressBar,
}

/// Creates the event channel for `tasks` units of `stages_per_task` stages.
pub fn channel(
    tasks: usize,
    stages_per_task: usize,
    show_progress: bool,
) -> (EventSender, ProgressAggregator) {
    let max_events = tasks.saturating_mul(stages_per_task);
    let (tx, rx) = mpsc::channel(max_events + 1);

    let bar = if show_progress {
        let bar = ProgressBar::new(max_events as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} stages {msg}",
        ) {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar
    } else {
        ProgressBar::hidden()
    };

    (
        EventSender { tx },
        ProgressAggregator {
            rx,
            dispatched: tasks,
            bar,
        },
    )
}

impl ProgressAggregator {
    /// Runs the aggregator on its own task.
    pub fn spawn(self) -> JoinHandle<RunReport> {
        tokio::spawn(self.run())
    }

    /// Drains events until the end-of-run marker arrives.
    pub async fn run(mut self) -> RunReport {
        let start = Instant::now();
        let mut report = RunReport {
            dispatched: self.dispatched,
            ..Default::default()
        };

        while let Some(message) = self.rx.recv().await {
            match message {
                Message::Stage(event) => self.observe(event, &mut report),
                Message::Finished => break,
            }
        }
        // Anything still buffered was sent before the marker by a clone.
        while let Ok(Message::Stage(event)) = self.rx.try_recv() {
            self.observe(event, &mut report);
        }

        report.elapsed = start.elapsed();
        self.bar.finish_and_clear();

        info!(
            tasks = report.dispatched,
            stages = report.progress,
            succeeded = report.successes,
            warnings = report.warnings,
            errors = report.errors.len(),
            timeouts = report.timeouts(),
            elapsed_secs = report.elapsed.as_secs(),
            "Run finished"
        );

        report
    }

    fn observe(&self, event: StageEvent, report: &mut RunReport) {
        report.progress += 1;
        match event.outcome {
            Outcome::Success => report.successes += 1,
            Outcome::SoftWarning(_) => report.warnings += 1,
            Outcome::HardError(err) => {
                if err.is_timeout() {
                    error!(task = %event.task, stage = %event.stage, error = %err, "Stage timed out");
                } else {
                    error!(task = %event.task, stage = %event.stage, error = %err, "Stage failed");
                }
                report.errors.push(err);
                self.bar.set_message(format!("({} failed)", report.errors.len()));
            }
        }
        self.bar.inc(1);
    }
}
