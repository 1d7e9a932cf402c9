//! Input partitioning and task discovery.
//!
//! A line-oriented input document is split into task units of at most N
//! lines. Each unit is a directory `task_<n>` holding an `input.json` with
//! its share of the lines. Discovery later rebuilds the unit list from the
//! directory names, ordered by the numeric suffix so that partition order,
//! stage order and reduction order always coincide.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::PartitionError;

/// Longest accepted input line, in bytes.
pub const MAX_LINE_BYTES: usize = 512 * 1024;

/// Name of the input artifact inside every task unit.
pub const INPUT_ARTIFACT: &str = "input.json";

/// Prefix of task unit directory names.
pub const TASK_PREFIX: &str = "task_";

/// One bounded chunk of the input plus its working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUnit {
    /// Ordinal position of the unit.
    pub index: usize,
    /// Directory name, `task_<index>`.
    pub name: String,
    /// Absolute or workdir-relative path of the unit directory.
    pub dir: PathBuf,
}

impl TaskUnit {
    /// Describes the unit with the given index under `root`.
    pub fn new(root: &Path, index: usize) -> Self {
        let name = format!("{TASK_PREFIX}{index}");
        Self {
            index,
            dir: root.join(&name),
            name,
        }
    }

    /// Resolves an artifact path relative to the unit directory.
    pub fn artifact(&self, relative: &str) -> PathBuf {
        self.dir.join(relative)
    }

    /// Parses the index out of a `task_<n>` directory name.
    pub fn parse_index(name: &str) -> Option<usize> {
        name.strip_prefix(TASK_PREFIX)?.parse().ok()
    }
}

/// Splits `source` into task units under `<workdir>/<tool>`.
///
/// Any existing `<workdir>/<tool>` tree is removed first. Each unit receives
/// at most `lines_per_task` lines in their original order; the last unit
/// holds the remainder. Line terminators are normalized to `\n`.
pub fn split_input(
    source: &Path,
    workdir: &Path,
    tool: &str,
    lines_per_task: usize,
) -> Result<Vec<TaskUnit>, PartitionError> {
    if lines_per_task == 0 {
        return Err(PartitionError::ZeroChunkSize);
    }

    let file = File::open(source).map_err(|source_err| PartitionError::OpenInput {
        path: source.to_path_buf(),
        source: source_err,
    })?;
    let mut reader = BufReader::new(file);

    let root = workdir.join(tool);
    if root.exists() {
        fs::remove_dir_all(&root)?;
    }
    fs::create_dir_all(&root)?;

    let mut units = Vec::new();
    let mut writer: Option<BufWriter<File>> = None;
    let mut lines_in_unit = 0usize;
    let mut line_number = 0usize;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf)?;
        if read == 0 {
            break;
        }
        line_number += 1;

        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        if buf.len() > MAX_LINE_BYTES {
            return Err(PartitionError::LineTooLong {
                path: source.to_path_buf(),
                line: line_number,
                limit: MAX_LINE_BYTES,
            });
        }

        if writer.is_none() {
            let unit = TaskUnit::new(&root, units.len());
            fs::create_dir_all(&unit.dir)?;
            writer = Some(BufWriter::new(File::create(unit.artifact(INPUT_ARTIFACT))?));
            debug!(task = %unit.name, "Task unit created");
            units.push(unit);
        }

        if let Some(out) = writer.as_mut() {
            out.write_all(&buf)?;
            out.write_all(b"\n")?;
        }
        lines_in_unit += 1;

        if lines_in_unit == lines_per_task {
            if let Some(mut out) = writer.take() {
                out.flush()?;
            }
            lines_in_unit = 0;
        }
    }

    if let Some(mut out) = writer.take() {
        out.flush()?;
    }

    info!(
        tool = tool,
        lines = line_number,
        units = units.len(),
        "Input document partitioned"
    );

    Ok(units)
}

/// Number of task units `split_input` would produce for `source`.
///
/// Reads the document without writing anything.
pub fn count_units(source: &Path, lines_per_task: usize) -> Result<usize, PartitionError> {
    if lines_per_task == 0 {
        return Err(PartitionError::ZeroChunkSize);
    }
    let file = File::open(source).map_err(|source_err| PartitionError::OpenInput {
        path: source.to_path_buf(),
        source: source_err,
    })?;
    let mut reader = BufReader::new(file);

    let mut lines = 0usize;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        lines += 1;
    }
    Ok(lines.div_ceil(lines_per_task))
}

/// Enumerates the task units under `root`, sorted by numeric index.
///
/// Entries that are not `task_<n>` directories are ignored.
pub fn discover_tasks(root: &Path) -> Result<Vec<TaskUnit>, PartitionError> {
    if !root.is_dir() {
        return Err(PartitionError::MissingTaskRoot(root.to_path_buf()));
    }

    let mut units = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(index) = name.to_str().and_then(TaskUnit::parse_index) else {
            continue;
        };
        units.push(TaskUnit::new(root, index));
    }

    units.sort_by_key(|unit| unit.index);
    Ok(units)
}
