//! Configuration for orchestration runs.
//!
//! [`RunConfig`] carries everything one run needs. It is built from CLI
//! flags, optionally layered over a YAML file ([`FileConfig`]), and is
//! immutable once the run starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pipeline::Tool;
use crate::provision::Readiness;

/// Default number of task runners executing at once.
pub const DEFAULT_WORKERS: usize = 10;

/// Default number of input lines per task unit.
pub const DEFAULT_LINES_PER_TASK: usize = 100;

/// Connection parameters for the auxiliary document databases.
///
/// Every field is required; there are no fallback values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub pubtator_db: String,
    pub pubtator_collection: String,
    pub medline_db: String,
    pub medline_text_collection: String,
}

impl DatabaseConfig {
    /// Assembles a config from individually optional parts.
    ///
    /// Returns `Ok(None)` when no part is set and an error naming the first
    /// missing field when only some are.
    pub fn from_parts(
        host: Option<String>,
        port: Option<u16>,
        pubtator_db: Option<String>,
        pubtator_collection: Option<String>,
        medline_db: Option<String>,
        medline_text_collection: Option<String>,
    ) -> Result<Option<Self>, ConfigError> {
        if host.is_none()
            && port.is_none()
            && pubtator_db.is_none()
            && pubtator_collection.is_none()
            && medline_db.is_none()
            && medline_text_collection.is_none()
        {
            return Ok(None);
        }

        fn require<T>(value: Option<T>, name: &str) -> Result<T, ConfigError> {
            value.ok_or_else(|| ConfigError::Missing(name.to_string()))
        }

        Ok(Some(Self {
            host: require(host, "mongo-host")?,
            port: require(port, "mongo-port")?,
            pubtator_db: require(pubtator_db, "pubtator-db")?,
            pubtator_collection: require(pubtator_collection, "pubtator-collection")?,
            medline_db: require(medline_db, "medline-db")?,
            medline_text_collection: require(medline_text_collection, "medline-text-collection")?,
        }))
    }

    /// Environment passed to stage containers that query the databases.
    pub fn to_env(&self) -> Vec<String> {
        vec![
            format!("MONGO_HOST={}", self.host),
            format!("MONGO_PORT={}", self.port),
            format!("PUBTATOR_DB={}", self.pubtator_db),
            format!("PUBTATOR_MEDLINE_COLLECTION={}", self.pubtator_collection),
            format!("MEDLINE_DB={}", self.medline_db),
            format!("MEDLINE_TEXT_COLLECTION={}", self.medline_text_collection),
        ]
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("mongo-host", &self.host),
            ("pubtator-db", &self.pubtator_db),
            ("pubtator-collection", &self.pubtator_collection),
            ("medline-db", &self.medline_db),
            ("medline-text-collection", &self.medline_text_collection),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid {
                field: "mongo-port".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Optional settings read from a YAML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub workers: Option<usize>,
    pub lines_per_task: Option<usize>,
    pub stage_timeout_secs: Option<u64>,
    pub readiness: Option<Readiness>,
    pub database: Option<DatabaseConfig>,
}

impl FileConfig {
    /// Loads a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parses config file content.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }
}

/// Configuration for one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Tool whose pipeline is run.
    pub tool: Tool,
    /// Root under which `<tool>/task_<n>` units live.
    pub workdir: PathBuf,
    /// Line-oriented input document.
    pub input: PathBuf,
    /// Destination of collection-level outputs.
    pub output_dir: PathBuf,
    /// Collection tag used in output file names.
    pub collection: String,
    /// Maximum task runners executing at once.
    pub workers: usize,
    /// Input lines per task unit.
    pub lines_per_task: usize,
    /// Deadline for a single stage container.
    pub stage_timeout: Option<Duration>,
    /// How auxiliary services are judged ready.
    pub readiness: Readiness,
    /// Database parameters, for tools that need them.
    pub database: Option<DatabaseConfig>,
    /// Skip partitioning and tasks already completed.
    pub resume: bool,
    /// Pull stage images before dispatch.
    pub pull_images: bool,
    /// Render the progress bar.
    pub show_progress: bool,
}

impl RunConfig {
    /// Creates a run configuration with defaults.
    pub fn new(
        tool: Tool,
        workdir: impl Into<PathBuf>,
        input: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            tool,
            workdir: workdir.into(),
            input: input.into(),
            output_dir: output_dir.into(),
            collection: collection.into(),
            workers: DEFAULT_WORKERS,
            lines_per_task: DEFAULT_LINES_PER_TASK,
            stage_timeout: None,
            readiness: Readiness::default(),
            database: None,
            resume: false,
            pull_images: true,
            show_progress: true,
        }
    }

    /// Applies values from a config file.
    pub fn with_file(mut self, file: FileConfig) -> Self {
        if let Some(workers) = file.workers {
            self.workers = workers;
        }
        if let Some(lines) = file.lines_per_task {
            self.lines_per_task = lines;
        }
        if let Some(secs) = file.stage_timeout_secs {
            self.stage_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(readiness) = file.readiness {
            self.readiness = readiness;
        }
        if file.database.is_some() {
            self.database = file.database;
        }
        self
    }

    /// Sets the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the number of lines per task.
    pub fn with_lines_per_task(mut self, lines: usize) -> Self {
        self.lines_per_task = lines;
        self
    }

    /// Sets the per-stage deadline.
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = Some(timeout);
        self
    }

    /// Sets the readiness policy for auxiliary services.
    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    /// Sets the database parameters.
    pub fn with_database(mut self, database: DatabaseConfig) -> Self {
        self.database = Some(database);
        self
    }

    /// Enables resuming a previous run.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Enables or disables image pulls.
    pub fn with_pull_images(mut self, pull: bool) -> Self {
        self.pull_images = pull;
        self
    }

    /// Enables or disables the progress bar.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Directory holding this tool's task units.
    pub fn task_root(&self) -> PathBuf {
        self.tool.definition().task_root(&self.workdir, &self.collection)
    }

    /// Checks the configuration before any side effect happens.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                field: "numtasks".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.lines_per_task == 0 {
            return Err(ConfigError::Invalid {
                field: "linespertask".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.workdir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("workdir".to_string()));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("outputdir".to_string()));
        }
        let partitions = !self.resume && self.tool.definition().partitioned;
        if partitions && self.input.as_os_str().is_empty() {
            return Err(ConfigError::Missing("inputfile".to_string()));
        }
        if self.collection.trim().is_empty() {
            return Err(ConfigError::Missing("collection".to_string()));
        }
        if self.stage_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid {
                field: "stage-timeout".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        match (&self.database, self.tool.definition().needs_database) {
            (Some(database), _) => database.validate()?,
            (None, true) => {
                return Err(ConfigError::Missing(format!(
                    "database parameters for tool '{}'",
                    self.tool
                )))
            }
            (None, false) => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database() -> DatabaseConfig {
        DatabaseConfig {
            host: "127.0.0.1".to_string(),
            port: 27017,
            pubtator_db: "pubtator".to_string(),
            pubtator_collection: "medline.aligned".to_string(),
            medline_db: "medline_current".to_string(),
            medline_text_collection: "text".to_string(),
        }
    }

    #[test]
    fn test_run_config_defaults() {
        let config = RunConfig::new(Tool::Rlimsp, "/w", "/in.json", "/out", "pmc");
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.lines_per_task, DEFAULT_LINES_PER_TASK);
        assert!(config.stage_timeout.is_none());
        assert!(config.pull_images);
        assert_eq!(config.task_root(), PathBuf::from("/w/rlimsp"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let config = RunConfig::new(Tool::Mirtex, "/w", "/in", "/out", "pmc").with_workers(0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let config =
            RunConfig::new(Tool::Mirtex, "/w", "/in", "/out", "pmc").with_lines_per_task(0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_egard_requires_database() {
        let config = RunConfig::new(Tool::Egard, "/w", "/in", "/out", "pmc");
        assert!(matches!(config.validate(), Err(ConfigError::Missing(_))));

        let config = config.with_database(database());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_database_from_parts() {
        assert!(DatabaseConfig::from_parts(None, None, None, None, None, None)
            .expect("no parts")
            .is_none());

        let partial = DatabaseConfig::from_parts(
            Some("db".to_string()),
            Some(27017),
            None,
            None,
            None,
            None,
        );
        assert!(matches!(partial, Err(ConfigError::Missing(field)) if field == "pubtator-db"));
    }

    #[test]
    fn test_database_env() {
        let env = database().to_env();
        assert!(env.contains(&"MONGO_HOST=127.0.0.1".to_string()));
        assert!(env.contains(&"MONGO_PORT=27017".to_string()));
        assert!(env.contains(&"MEDLINE_TEXT_COLLECTION=text".to_string()));
        assert_eq!(env.len(), 6);
    }

    #[test]
    fn test_file_config_overrides_defaults() {
        let file = FileConfig::parse(
            r#"
workers: 3
lines_per_task: 20
stage_timeout_secs: 600
database:
  host: mongo
  port: 27017
  pubtator_db: pubtator
  pubtator_collection: medline.aligned
  medline_db: medline_current
  medline_text_collection: text
"#,
        )
        .expect("parse");

        let config = RunConfig::new(Tool::Egard, "/w", "/in", "/out", "pmc").with_file(file);
        assert_eq!(config.workers, 3);
        assert_eq!(config.lines_per_task, 20);
        assert_eq!(config.stage_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.database.as_ref().map(|d| d.host.as_str()), Some("mongo"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_config_rejects_unknown_fields() {
        assert!(FileConfig::parse("wokers: 3\n").is_err());
    }
}
