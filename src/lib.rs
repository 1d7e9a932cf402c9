//! itextmine: containerized text-mining pipelines over large document collections.
//!
//! A run splits a line-oriented input document into task units, provisions
//! the networks and database services a tool needs, drives every unit
//! through the tool's chain of disposable stage containers with bounded
//! parallelism, and finally concatenates per-unit results into
//! collection-level files.

pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod orchestrator;
pub mod partition;
pub mod pipeline;
pub mod progress;
pub mod provision;
pub mod reconcile;
pub mod reduce;
pub mod scheduler;

// Re-export commonly used types
pub use config::{DatabaseConfig, RunConfig};
pub use error::{
    ConfigError, DockerError, PartitionError, ReconcileError, ReduceError, RunError, SetupError,
    StageError,
};
pub use orchestrator::{Orchestrator, RunPlan, RunSummary};
pub use pipeline::Tool;
