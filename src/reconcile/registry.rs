//! Persisted registry of resources created by a run.
//!
//! Every network and service container the provisioner creates is written
//! to `<workdir>/.itextmine/<tool>.json` before provisioning returns. A
//! crashed run therefore leaves a precise list of what to remove, keyed by
//! the run identifier.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Directory under the workdir holding registries.
pub const REGISTRY_DIR: &str = ".itextmine";

/// One resource known to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredResource {
    pub id: String,
    pub name: String,
}

/// On-disk content of a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub tool: String,
    pub run_id: Option<String>,
    pub networks: Vec<RegisteredResource>,
    pub containers: Vec<RegisteredResource>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Registry of the resources one tool's runs have created.
#[derive(Debug)]
pub struct ResourceRegistry {
    path: PathBuf,
    record: RegistryRecord,
}

impl ResourceRegistry {
    /// Location of the registry for `tool` under `workdir`.
    pub fn path_for(workdir: &Path, tool: &str) -> PathBuf {
        workdir.join(REGISTRY_DIR).join(format!("{tool}.json"))
    }

    /// Opens the registry, starting empty when none was written yet.
    ///
    /// An unreadable registry is also treated as empty; reconciliation then
    /// relies on name patterns alone.
    pub fn open(workdir: &Path, tool: &str) -> io::Result<Self> {
        let path = Self::path_for(workdir, tool);
        let empty = RegistryRecord {
            tool: tool.to_string(),
            ..Default::default()
        };
        let record = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring corrupt resource registry");
                    empty
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => empty,
            Err(e) => return Err(e),
        };
        Ok(Self { path, record })
    }

    /// Starts recording for a new run.
    pub fn begin_run(&mut self, run_id: &str) -> io::Result<()> {
        self.record.run_id = Some(run_id.to_string());
        self.persist()
    }

    pub fn run_id(&self) -> Option<&str> {
        self.record.run_id.as_deref()
    }

    pub fn networks(&self) -> &[RegisteredResource] {
        &self.record.networks
    }

    pub fn containers(&self) -> &[RegisteredResource] {
        &self.record.containers
    }

    pub fn is_empty(&self) -> bool {
        self.record.networks.is_empty() && self.record.containers.is_empty()
    }

    pub fn record_network(&mut self, id: &str, name: &str) -> io::Result<()> {
        self.record.networks.push(RegisteredResource {
            id: id.to_string(),
            name: name.to_string(),
        });
        self.persist()
    }

    pub fn record_container(&mut self, id: &str, name: &str) -> io::Result<()> {
        self.record.containers.push(RegisteredResource {
            id: id.to_string(),
            name: name.to_string(),
        });
        self.persist()
    }

    pub fn forget(&mut self, id: &str) -> io::Result<()> {
        self.record.networks.retain(|r| r.id != id);
        self.record.containers.retain(|r| r.id != id);
        self.persist()
    }

    /// Drops every entry and the run identifier.
    pub fn clear(&mut self) -> io::Result<()> {
        self.record.networks.clear();
        self.record.containers.clear();
        self.record.run_id = None;
        self.persist()
    }

    /// Writes the record through a temporary file renamed into place.
    fn persist(&mut self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.record.updated_at = Some(Utc::now());
        let json = serde_json::to_string_pretty(&self.record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut registry = ResourceRegistry::open(dir.path(), "rlimsp").expect("open");
        assert!(registry.is_empty());

        registry.begin_run("run-1").expect("begin");
        registry.record_network("net-1", "rlimsp").expect("record");
        registry.record_container("c-1", "rlimsp-mysql").expect("record");

        let reopened = ResourceRegistry::open(dir.path(), "rlimsp").expect("reopen");
        assert_eq!(reopened.run_id(), Some("run-1"));
        assert_eq!(reopened.networks()[0].name, "rlimsp");
        assert_eq!(reopened.containers()[0].id, "c-1");
        assert!(ResourceRegistry::path_for(dir.path(), "rlimsp").ends_with(".itextmine/rlimsp.json"));
    }

    #[test]
    fn test_forget_and_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut registry = ResourceRegistry::open(dir.path(), "egard").expect("open");
        registry.record_network("n1", "egard_rlimsp_net").expect("record");
        registry.record_network("n2", "mace2k_net").expect("record");
        registry.forget("n1").expect("forget");
        assert_eq!(registry.networks().len(), 1);

        registry.clear().expect("clear");
        let reopened = ResourceRegistry::open(dir.path(), "egard").expect("reopen");
        assert!(reopened.is_empty());
        assert!(reopened.run_id().is_none());
    }

    #[test]
    fn test_corrupt_registry_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = ResourceRegistry::path_for(dir.path(), "mirtex");
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, "{\"tool\": \"mirtex\", \"netw").expect("write");

        let mut registry = ResourceRegistry::open(dir.path(), "mirtex").expect("open");
        assert!(registry.is_empty());
        assert!(registry.run_id().is_none());

        registry.begin_run("run-2").expect("begin");
        let reopened = ResourceRegistry::open(dir.path(), "mirtex").expect("reopen");
        assert_eq!(reopened.run_id(), Some("run-2"));
    }

    #[test]
    fn test_persist_leaves_no_temporary_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut registry = ResourceRegistry::open(dir.path(), "rlimsp").expect("open");
        registry.record_network("net-1", "rlimsp").expect("record");

        let entries: Vec<String> = fs::read_dir(dir.path().join(REGISTRY_DIR))
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["rlimsp.json".to_string()]);
    }
}
