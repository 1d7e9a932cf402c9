//! Per-task execution state, persisted next to the task's artifacts.
//!
//! Every task unit carries a `state.json` manifest that records where the
//! task is in its stage chain. Resumed runs read it to skip tasks that
//! already completed.

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::partition::TaskUnit;

/// Name of the manifest file inside a task unit.
pub const STATE_FILE: &str = "state.json";

/// Position of a task in its stage chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running { stage: String },
    StageDone { stage: String },
    Failed { stage: String, error: String },
    Completed,
    Reduced,
}

impl TaskState {
    /// True once every stage ran without a hard failure.
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Reduced)
    }
}

/// The persisted manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskManifest {
    pub task: String,
    pub state: TaskState,
    /// Run that last touched the task.
    pub run_id: String,
    pub updated_at: DateTime<Utc>,
}

impl TaskManifest {
    pub fn new(task: &TaskUnit, run_id: &str, state: TaskState) -> Self {
        Self {
            task: task.name.clone(),
            state,
            run_id: run_id.to_string(),
            updated_at: Utc::now(),
        }
    }

    /// Reads the manifest of a task, if one was written.
    pub fn load(dir: &Path) -> io::Result<Option<Self>> {
        let path = dir.join(STATE_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Writes the manifest atomically through a temporary file.
    pub fn save(&self, dir: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = dir.join(format!("{STATE_FILE}.tmp"));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, dir.join(STATE_FILE))
    }
}

/// Records a state transition. Failures to persist are logged, not raised.
pub fn record(task: &TaskUnit, run_id: &str, state: TaskState) {
    let manifest = TaskManifest::new(task, run_id, state);
    if let Err(e) = manifest.save(&task.dir) {
        warn!(task = %task.name, error = %e, "Failed to persist task state");
    }
}

/// Current state of a task; `Pending` when no manifest exists or it is unreadable.
pub fn current(task: &TaskUnit) -> TaskState {
    match TaskManifest::load(&task.dir) {
        Ok(Some(manifest)) => manifest.state,
        Ok(None) => TaskState::Pending,
        Err(e) => {
            warn!(task = %task.name, error = %e, "Ignoring unreadable task state");
            TaskState::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_manifest_is_pending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let task = TaskUnit::new(dir.path(), 0);
        fs::create_dir_all(&task.dir).expect("mkdir");
        assert_eq!(current(&task), TaskState::Pending);
    }

    #[test]
    fn test_record_and_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let task = TaskUnit::new(dir.path(), 4);
        fs::create_dir_all(&task.dir).expect("mkdir");

        record(
            &task,
            "run-9",
            TaskState::Failed {
                stage: "align".to_string(),
                error: "exit 1".to_string(),
            },
        );
        let manifest = TaskManifest::load(&task.dir).expect("load").expect("present");
        assert_eq!(manifest.task, "task_4");
        assert_eq!(manifest.run_id, "run-9");
        assert!(matches!(manifest.state, TaskState::Failed { ref stage, .. } if stage == "align"));
        assert!(!manifest.state.is_finished());

        record(&task, "run-9", TaskState::Completed);
        assert!(current(&task).is_finished());
    }

    #[test]
    fn test_state_json_shape() {
        let json = serde_json::to_value(TaskState::Running {
            stage: "rlimsp".to_string(),
        })
        .expect("serialize");
        assert_eq!(json["state"], "running");
        assert_eq!(json["stage"], "rlimsp");
    }

    #[test]
    fn test_corrupt_manifest_is_pending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let task = TaskUnit::new(dir.path(), 0);
        fs::create_dir_all(&task.dir).expect("mkdir");
        fs::write(task.dir.join(STATE_FILE), "{not json").expect("write");
        assert_eq!(current(&task), TaskState::Pending);
    }
}
