//! Error types for itextmine operations.
//!
//! Defines error types for every subsystem of the orchestration engine:
//! - Container runtime calls
//! - Input partitioning
//! - Stale resource reconciliation
//! - Network and service provisioning
//! - Pipeline stage execution
//! - Result reduction
//! - Configuration

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the container runtime.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Failed to pull image '{image}': {reason}")]
    PullFailed { image: String, reason: String },

    #[error("Failed to create container '{name}': {reason}")]
    CreateFailed { name: String, reason: String },

    #[error("Docker run failed: {0}")]
    RunFailed(String),

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("Resource '{name}' already exists")]
    Conflict { name: String },

    #[error("Network operation failed: {0}")]
    NetworkFailed(String),

    #[error("Failed to remove '{id}': {reason}")]
    RemoveFailed { id: String, reason: String },
}

impl DockerError {
    /// Returns true if the error reports an already existing resource.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DockerError::Conflict { .. })
    }

    /// Returns true if the error reports a missing resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DockerError::ContainerNotFound { .. })
    }
}

/// Errors that can occur while splitting an input document into task units.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("Failed to open input document '{path}': {source}")]
    OpenInput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Line {line} of '{path}' exceeds the {limit} byte line limit")]
    LineTooLong {
        path: PathBuf,
        line: usize,
        limit: usize,
    },

    #[error("Lines per task must be greater than zero")]
    ZeroChunkSize,

    #[error("Task directory '{0}' not found")]
    MissingTaskRoot(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while removing resources left over by an earlier run.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Invalid name pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Failed to remove stale {kind} '{name}': {source}")]
    RemoveFailed {
        kind: &'static str,
        name: String,
        #[source]
        source: DockerError,
    },

    #[error("Failed to list stale resources: {0}")]
    ListFailed(#[source] DockerError),

    #[error("Resource registry error: {0}")]
    Registry(String),
}

/// Errors raised while provisioning run-wide networks and services.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Resource '{name}' already exists")]
    ResourceConflict { name: String },

    #[error("Failed to create network '{name}': {source}")]
    Network {
        name: String,
        #[source]
        source: DockerError,
    },

    #[error("Failed to start service '{name}': {source}")]
    Service {
        name: String,
        #[source]
        source: DockerError,
    },

    #[error("Service '{name}' not ready after {attempts} attempts")]
    NotReady { name: String, attempts: u32 },

    #[error("Failed to pull image '{image}': {source}")]
    Pull {
        image: String,
        #[source]
        source: DockerError,
    },

    #[error("Resource registry error: {0}")]
    Registry(String),
}

/// Errors scoped to a single pipeline stage of a single task unit.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("[{task}/{stage}] required input '{}' is missing", path.display())]
    MissingInput {
        task: String,
        stage: String,
        path: PathBuf,
    },

    #[error("[{task}/{stage}] failed to prepare '{}': {source}", path.display())]
    Prepare {
        task: String,
        stage: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[{task}/{stage}] container runtime error: {source}")]
    Runtime {
        task: String,
        stage: String,
        #[source]
        source: DockerError,
    },

    #[error("[{task}/{stage}] container exited with code {code}")]
    NonZeroExit {
        task: String,
        stage: String,
        code: i64,
    },

    #[error("[{task}/{stage}] output '{}' is empty or absent", path.display())]
    EmptyOutput {
        task: String,
        stage: String,
        path: PathBuf,
    },

    #[error("[{task}/{stage}] timed out after {timeout:?}")]
    Timeout {
        task: String,
        stage: String,
        timeout: Duration,
    },
}

impl StageError {
    /// Name of the task unit the error belongs to.
    pub fn task(&self) -> &str {
        match self {
            StageError::MissingInput { task, .. }
            | StageError::Prepare { task, .. }
            | StageError::Runtime { task, .. }
            | StageError::NonZeroExit { task, .. }
            | StageError::EmptyOutput { task, .. }
            | StageError::Timeout { task, .. } => task,
        }
    }

    /// Name of the stage that failed.
    pub fn stage(&self) -> &str {
        match self {
            StageError::MissingInput { stage, .. }
            | StageError::Prepare { stage, .. }
            | StageError::Runtime { stage, .. }
            | StageError::NonZeroExit { stage, .. }
            | StageError::EmptyOutput { stage, .. }
            | StageError::Timeout { stage, .. } => stage,
        }
    }

    /// Returns true for deadline expiry, which is reported apart from other failures.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StageError::Timeout { .. })
    }
}

/// Errors raised while consolidating per-task artifacts.
#[derive(Debug, Error)]
pub enum ReduceError {
    #[error("Task directory '{0}' not found")]
    MissingTaskRoot(PathBuf),

    #[error("Task '{task}' is missing required artifact '{artifact}'")]
    MissingArtifact { task: String, artifact: String },

    #[error("Reduced output '{}' is empty", path.display())]
    EmptyResult { path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors in user supplied configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown tool '{0}'")]
    UnknownTool(String),

    #[error("Missing required configuration value: {0}")]
    Missing(String),

    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: String, reason: String },

    #[error("Failed to read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Top-level error returned by a run of the orchestrator.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Reduce(#[from] ReduceError),

    #[error(transparent)]
    Docker(#[from] DockerError),

    #[error(transparent)]
    Pool(#[from] crate::scheduler::PoolError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Run interrupted with {skipped} task(s) not started")]
    Interrupted { skipped: u64 },

    /// Tasks that stopped without reporting a stage outcome, e.g. by panicking.
    #[error("{count} task(s) aborted without reporting a result")]
    TasksAborted { count: u64 },

    /// One or more stages failed; `first` is the representative error.
    #[error("{first} ({total} stage failure(s) in total)")]
    TasksFailed { first: StageError, total: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_accessors() {
        let err = StageError::NonZeroExit {
            task: "task_1".to_string(),
            stage: "rlimsp".to_string(),
            code: 2,
        };
        assert_eq!(err.task(), "task_1");
        assert_eq!(err.stage(), "rlimsp");
        assert!(!err.is_timeout());
        assert!(err.to_string().contains("code 2"));
    }

    #[test]
    fn test_timeout_is_distinct() {
        let err = StageError::Timeout {
            task: "task_0".to_string(),
            stage: "align".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_tasks_failed_display_uses_first_error() {
        let first = StageError::MissingInput {
            task: "task_3".to_string(),
            stage: "efip".to_string(),
            path: PathBuf::from("/w/task_3/output.txt"),
        };
        let err = RunError::TasksFailed { first, total: 4 };
        let msg = err.to_string();
        assert!(msg.contains("task_3/efip"));
        assert!(msg.contains("4 stage failure"));
    }

    #[test]
    fn test_docker_error_classification() {
        assert!(DockerError::Conflict {
            name: "rlimsp".to_string()
        }
        .is_conflict());
        assert!(DockerError::ContainerNotFound {
            id: "abc".to_string()
        }
        .is_not_found());
        assert!(!DockerError::RunFailed("x".to_string()).is_conflict());
    }
}
