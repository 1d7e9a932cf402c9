//! Pipeline stage descriptors and the single-stage executor.
//!
//! A stage runs one external tool as a disposable container. The executor
//! verifies the stage's input artifacts, truncates its outputs, runs the
//! container with the task's files bind-mounted at fixed paths, removes the
//! container on every exit path and finally checks the success artifact.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::DatabaseConfig;
use crate::error::{DockerError, StageError};
use crate::execution::{
    run_labels, Container, ContainerRuntime, ContainerSpec, NetworkAttachment, WaitOutcome,
};
use crate::partition::TaskUnit;
use crate::pipeline::tools::Tool;

/// How a stage treats an empty success artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    /// Empty output fails the stage.
    Hard,
    /// Empty output is logged and accepted.
    Soft,
}

/// Whether a bound file is consumed or produced by the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindRole {
    /// Must exist before the stage starts.
    Input,
    /// Created empty before the stage starts.
    Output,
}

/// A task file mounted into the stage container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    /// Path relative to the task unit directory.
    pub artifact: String,
    /// Fixed path inside the container.
    pub container_path: String,
    pub read_only: bool,
    pub role: BindRole,
}

impl BindSpec {
    /// An input artifact.
    pub fn input(artifact: &str, container_path: &str) -> Self {
        Self {
            artifact: artifact.to_string(),
            container_path: container_path.to_string(),
            read_only: false,
            role: BindRole::Input,
        }
    }

    /// An output artifact.
    pub fn output(artifact: &str, container_path: &str) -> Self {
        Self {
            artifact: artifact.to_string(),
            container_path: container_path.to_string(),
            read_only: false,
            role: BindRole::Output,
        }
    }

    /// Mounts the file read-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Renders the bind in `host:container[:ro]` form.
    pub fn render(&self, host: &Path) -> String {
        let mut bind = format!("{}:{}", host.display(), self.container_path);
        if self.read_only {
            bind.push_str(":ro");
        }
        bind
    }
}

/// Static configuration of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    pub name: String,
    pub image: String,
    pub kind: StageKind,
    pub binds: Vec<BindSpec>,
    /// Extra environment in `KEY=VALUE` form.
    pub env: Vec<String>,
    pub network: Option<NetworkAttachment>,
    /// Artifact whose non-emptiness proves the stage produced something.
    pub success_artifact: String,
    /// Stage subdirectory created inside the task unit.
    pub subdir: Option<String>,
    /// Pass the database parameters as environment.
    pub database_env: bool,
}

impl StageDescriptor {
    fn new(name: &str, image: &str, kind: StageKind, success_artifact: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            kind,
            binds: Vec::new(),
            env: Vec::new(),
            network: None,
            success_artifact: success_artifact.to_string(),
            subdir: None,
            database_env: false,
        }
    }

    /// A stage whose empty output is a failure.
    pub fn hard(name: &str, image: &str, success_artifact: &str) -> Self {
        Self::new(name, image, StageKind::Hard, success_artifact)
    }

    /// A stage whose empty output is accepted.
    pub fn soft(name: &str, image: &str, success_artifact: &str) -> Self {
        Self::new(name, image, StageKind::Soft, success_artifact)
    }

    pub fn with_binds(mut self, binds: Vec<BindSpec>) -> Self {
        self.binds = binds;
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_network(mut self, network: NetworkAttachment) -> Self {
        self.network = Some(network);
        self
    }

    pub fn with_subdir(mut self, subdir: &str) -> Self {
        self.subdir = Some(subdir.to_string());
        self
    }

    pub fn with_database_env(mut self) -> Self {
        self.database_env = true;
        self
    }

    fn inputs(&self) -> impl Iterator<Item = &BindSpec> {
        self.binds.iter().filter(|b| b.role == BindRole::Input)
    }

    fn outputs(&self) -> impl Iterator<Item = &BindSpec> {
        self.binds.iter().filter(|b| b.role == BindRole::Output)
    }
}

/// Run-wide collaborators shared by every stage execution.
pub struct StageContext {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub tool: Tool,
    /// Identifier stamped on every container of the run.
    pub run_id: String,
    /// Deadline for a single stage container.
    pub timeout: Option<Duration>,
    pub database: Option<DatabaseConfig>,
}

impl StageContext {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, tool: Tool, run_id: impl Into<String>) -> Self {
        Self {
            runtime,
            tool,
            run_id: run_id.into(),
            timeout: None,
            database: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_database(mut self, database: Option<DatabaseConfig>) -> Self {
        self.database = database;
        self
    }
}

/// Result of a stage that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageStatus {
    /// The success artifact is non-empty.
    Produced,
    /// A soft stage left its success artifact empty.
    Empty(PathBuf),
}

/// Runs one stage of one task unit.
///
/// The container, once created, is removed exactly once whatever happens
/// after creation.
pub async fn run_stage(
    ctx: &StageContext,
    stage: &StageDescriptor,
    task: &TaskUnit,
) -> Result<StageStatus, StageError> {
    let task_name = task.name.as_str();
    let stage_name = stage.name.as_str();

    for bind in stage.inputs() {
        let path = task.artifact(&bind.artifact);
        if !path.is_file() {
            return Err(StageError::MissingInput {
                task: task_name.to_string(),
                stage: stage_name.to_string(),
                path,
            });
        }
    }

    let prepare = |path: PathBuf, source: std::io::Error| StageError::Prepare {
        task: task_name.to_string(),
        stage: stage_name.to_string(),
        path,
        source,
    };

    if let Some(subdir) = &stage.subdir {
        let dir = task.artifact(subdir);
        fs::create_dir_all(&dir).map_err(|e| prepare(dir.clone(), e))?;
    }
    for bind in stage.outputs() {
        let path = task.artifact(&bind.artifact);
        File::create(&path).map_err(|e| prepare(path.clone(), e))?;
    }

    let mut binds = Vec::with_capacity(stage.binds.len());
    for bind in &stage.binds {
        let path = task.artifact(&bind.artifact);
        let host = fs::canonicalize(&path).map_err(|e| prepare(path.clone(), e))?;
        binds.push(bind.render(&host));
    }

    let mut env = stage.env.clone();
    if stage.database_env {
        match &ctx.database {
            Some(database) => env.extend(database.to_env()),
            None => warn!(
                task = %task_name,
                stage = %stage_name,
                "Stage expects database parameters but none are configured"
            ),
        }
    }

    let mut spec = ContainerSpec::new(ctx.tool.container_name(stage_name, task_name), &stage.image)
        .with_binds(binds)
        .with_env(env)
        .with_labels(run_labels(ctx.tool.name(), &ctx.run_id));
    if let Some(network) = &stage.network {
        spec = spec.with_network(network.clone());
    }

    let runtime = ctx.runtime.as_ref();
    let runtime_err = |source: DockerError| StageError::Runtime {
        task: task_name.to_string(),
        stage: stage_name.to_string(),
        source,
    };

    let mut container = Container::create(runtime, &spec)
        .await
        .map_err(runtime_err)?;
    debug!(task = %task_name, stage = %stage_name, container = %container.id(), "Stage container created");

    let outcome = execute(&mut container, runtime, ctx.timeout).await;
    let cleanup = container.cleanup(runtime).await;

    let code = match outcome {
        Ok(WaitOutcome::Exited(code)) => code,
        Ok(WaitOutcome::TimedOut) => {
            if let Err(e) = cleanup {
                warn!(task = %task_name, stage = %stage_name, error = %e, "Failed to remove timed out container");
            }
            return Err(StageError::Timeout {
                task: task_name.to_string(),
                stage: stage_name.to_string(),
                timeout: ctx.timeout.unwrap_or_default(),
            });
        }
        Err(e) => {
            if let Err(cleanup_err) = cleanup {
                warn!(task = %task_name, stage = %stage_name, error = %cleanup_err, "Failed to remove container");
            }
            return Err(runtime_err(e));
        }
    };
    cleanup.map_err(runtime_err)?;

    if code != 0 {
        return Err(StageError::NonZeroExit {
            task: task_name.to_string(),
            stage: stage_name.to_string(),
            code,
        });
    }

    let artifact = task.artifact(&stage.success_artifact);
    if has_content(&artifact) {
        return Ok(StageStatus::Produced);
    }

    match stage.kind {
        StageKind::Soft => {
            warn!(
                task = %task_name,
                stage = %stage_name,
                path = %artifact.display(),
                "Stage produced no output"
            );
            Ok(StageStatus::Empty(artifact))
        }
        StageKind::Hard => Err(StageError::EmptyOutput {
            task: task_name.to_string(),
            stage: stage_name.to_string(),
            path: artifact,
        }),
    }
}

async fn execute(
    container: &mut Container,
    runtime: &dyn ContainerRuntime,
    deadline: Option<Duration>,
) -> Result<WaitOutcome, DockerError> {
    container.start(runtime).await?;
    container.wait(runtime, deadline).await
}

/// True if the file exists and holds at least one byte.
pub fn has_content(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}
