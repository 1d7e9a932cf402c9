//! Result reduction.
//!
//! After every task unit finished, each artifact named in the tool's
//! reduction plan is concatenated across units, in numeric task order, into
//! `<output_dir>/<tool>/<prefix>.<collection>.<kind>.json`. Tools with a
//! downstream consumer then copy one artifact per unit into the
//! downstream tool's task layout.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{PartitionError, ReduceError};
use crate::partition::{discover_tasks, TaskUnit};
use crate::pipeline::state::{self, TaskManifest, TaskState};
use crate::pipeline::{ArtifactPlan, RestagePlan, ToolDefinition};

/// What a reduction produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReduceReport {
    /// Task units reduced.
    pub tasks: usize,
    /// Collection-level files written.
    pub outputs: Vec<PathBuf>,
    /// Artifacts copied into a downstream task layout.
    pub restaged: usize,
    /// Downstream task root, when the tool re-stages.
    pub restage_root: Option<PathBuf>,
}

/// Reduces the task units of `definition` under `workdir`.
///
/// Fails when a unit lacks a required artifact or when any concatenation
/// is empty. Output files are written through a temporary file, so a failed
/// reduction never leaves a truncated result under its final name.
pub fn reduce(
    workdir: &Path,
    output_dir: &Path,
    definition: &ToolDefinition,
    collection: &str,
) -> Result<ReduceReport, ReduceError> {
    let task_root = definition.task_root(workdir, collection);
    let tasks = discover_tasks(&task_root).map_err(|e| match e {
        PartitionError::MissingTaskRoot(path) => ReduceError::MissingTaskRoot(path),
        PartitionError::Io(e) => ReduceError::Io(e),
        other => ReduceError::Io(io::Error::other(other.to_string())),
    })?;

    let tool_output_dir = output_dir.join(definition.tool.name());
    fs::create_dir_all(&tool_output_dir)?;

    let mut report = ReduceReport {
        tasks: tasks.len(),
        ..Default::default()
    };

    for plan in &definition.reduction {
        let path = tool_output_dir.join(plan.output_name(collection));
        concatenate(&tasks, plan, &path)?;
        info!(
            artifact = %plan.artifact,
            output = %path.display(),
            tasks = tasks.len(),
            "Reduced artifact"
        );
        report.outputs.push(path);
    }

    if let Some(restage) = &definition.restage {
        let root = restage
            .downstream
            .definition()
            .task_root(workdir, collection);
        report.restaged = restage_artifacts(&tasks, restage, &root)?;
        info!(
            artifact = %restage.artifact,
            downstream = %restage.downstream,
            root = %root.display(),
            count = report.restaged,
            "Re-staged artifacts for downstream tool"
        );
        report.restage_root = Some(root);
    }

    for task in &tasks {
        mark_reduced(task);
    }

    Ok(report)
}

/// Concatenates `plan.artifact` of every task into `dest`.
fn concatenate(tasks: &[TaskUnit], plan: &ArtifactPlan, dest: &Path) -> Result<(), ReduceError> {
    let tmp = dest.with_extension("json.tmp");
    let written = match write_concatenation(tasks, plan, &tmp) {
        Ok(written) => written,
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
    };

    if written == 0 {
        let _ = fs::remove_file(&tmp);
        return Err(ReduceError::EmptyResult {
            path: dest.to_path_buf(),
        });
    }

    fs::rename(&tmp, dest)?;
    Ok(())
}

fn write_concatenation(
    tasks: &[TaskUnit],
    plan: &ArtifactPlan,
    tmp: &Path,
) -> Result<u64, ReduceError> {
    let mut writer = BufWriter::new(File::create(tmp)?);
    let mut written = 0u64;

    for task in tasks {
        let path = task.artifact(&plan.artifact);
        let mut source = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if plan.required {
                    return Err(ReduceError::MissingArtifact {
                        task: task.name.clone(),
                        artifact: plan.artifact.clone(),
                    });
                }
                debug!(task = %task.name, artifact = %plan.artifact, "Artifact absent, skipping");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        written += io::copy(&mut source, &mut writer)?;
    }

    writer.flush()?;
    Ok(written)
}

/// Copies one artifact per task into `<root>/<task>/<artifact>`.
///
/// The upstream tree is left intact. Any previous `root` is replaced.
fn restage_artifacts(
    tasks: &[TaskUnit],
    plan: &RestagePlan,
    root: &Path,
) -> Result<usize, ReduceError> {
    if root.exists() {
        fs::remove_dir_all(root)?;
    }

    for task in tasks {
        let source = task.artifact(&plan.artifact);
        if !source.is_file() {
            return Err(ReduceError::MissingArtifact {
                task: task.name.clone(),
                artifact: plan.artifact.clone(),
            });
        }
        let dest_dir = root.join(&task.name);
        fs::create_dir_all(&dest_dir)?;
        fs::copy(&source, dest_dir.join(&plan.artifact))?;
    }

    Ok(tasks.len())
}

fn mark_reduced(task: &TaskUnit) {
    let run_id = match TaskManifest::load(&task.dir) {
        Ok(Some(manifest)) => manifest.run_id,
        Ok(None) => String::new(),
        Err(e) => {
            warn!(task = %task.name, error = %e, "Replacing unreadable task state");
            String::new()
        }
    };
    state::record(task, &run_id, TaskState::Reduced);
}
