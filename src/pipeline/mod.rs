//! Tool pipelines: stage descriptors, the stage executor and the task runner.
//!
//! # Architecture
//!
//! ```text
//!   TaskUnit ──▶ run_task ──▶ run_stage(stage 1) ──▶ run_stage(stage 2) ──▶ ...
//!                  │               │
//!                  │               └── create ▶ start ▶ wait ▶ remove ▶ check output
//!                  └── state.json (Running / StageDone / Failed / Completed)
//! ```
//!
//! The chain for each tool comes from the static catalog in [`tools`].

pub mod runner;
pub mod stage;
pub mod state;
pub mod tools;

pub use runner::{run_task, TaskRunner};
pub use stage::{
    has_content, run_stage, BindRole, BindSpec, StageContext, StageDescriptor, StageKind,
    StageStatus,
};
pub use state::{TaskManifest, TaskState, STATE_FILE};
pub use tools::{ArtifactPlan, RestagePlan, Tool, ToolDefinition};
