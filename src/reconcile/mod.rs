//! Removal of resources left over by an earlier, interrupted run.
//!
//! Reconciliation runs before provisioning so that provisioning never trips
//! over a name that is still taken. It removes, in order:
//!
//! 1. every container and network recorded in the [`ResourceRegistry`],
//! 2. containers whose name matches one of the tool's glob patterns,
//! 3. networks carrying one of the tool's network names,
//!
//! and then clears the registry. Finding nothing to remove is a success.

pub mod registry;

use std::collections::HashSet;

use glob::Pattern;
use tracing::{debug, info};

use crate::error::{DockerError, ReconcileError};
use crate::execution::ContainerRuntime;

pub use registry::{RegisteredResource, RegistryRecord, ResourceRegistry, REGISTRY_DIR};

/// What a reconciliation pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub containers_removed: usize,
    pub networks_removed: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.containers_removed == 0 && self.networks_removed == 0
    }
}

/// Stale resources of one tool.
#[derive(Debug, Clone)]
pub struct Reconciler {
    patterns: Vec<Pattern>,
    network_names: Vec<String>,
}

impl Reconciler {
    /// Compiles the container name patterns.
    pub fn new(container_patterns: &[String], network_names: &[String]) -> Result<Self, ReconcileError> {
        let patterns = container_patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| ReconcileError::InvalidPattern {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            patterns,
            network_names: network_names.to_vec(),
        })
    }

    /// True if a container name matches any pattern.
    pub fn matches_container(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }

    /// Force-removes every stale resource.
    pub async fn run(
        &self,
        runtime: &dyn ContainerRuntime,
        registry: &mut ResourceRegistry,
    ) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();
        let mut removed_ids = HashSet::new();

        if let Some(run_id) = registry.run_id() {
            debug!(run_id = run_id, "Removing resources recorded by previous run");
        }
        for resource in registry.containers().to_vec() {
            if remove_container(runtime, &resource.id, &resource.name).await? {
                report.containers_removed += 1;
            }
            removed_ids.insert(resource.id);
        }

        for pattern in &self.patterns {
            let filter = literal_prefix(pattern.as_str());
            let candidates = runtime
                .list_containers(filter)
                .await
                .map_err(ReconcileError::ListFailed)?;
            for container in candidates {
                if removed_ids.contains(&container.id) || !pattern.matches(&container.name) {
                    continue;
                }
                if remove_container(runtime, &container.id, &container.name).await? {
                    report.containers_removed += 1;
                }
                removed_ids.insert(container.id);
            }
        }

        for resource in registry.networks().to_vec() {
            if remove_network(runtime, &resource.id, &resource.name).await? {
                report.networks_removed += 1;
            }
            removed_ids.insert(resource.id);
        }

        for name in &self.network_names {
            let candidates = runtime
                .list_networks(name)
                .await
                .map_err(ReconcileError::ListFailed)?;
            for network in candidates {
                if network.name != *name || removed_ids.contains(&network.id) {
                    continue;
                }
                if remove_network(runtime, &network.id, &network.name).await? {
                    report.networks_removed += 1;
                }
                removed_ids.insert(network.id);
            }
        }

        registry
            .clear()
            .map_err(|e| ReconcileError::Registry(e.to_string()))?;

        if report.is_empty() {
            debug!("No stale resources found");
        } else {
            info!(
                containers = report.containers_removed,
                networks = report.networks_removed,
                "Removed stale resources"
            );
        }

        Ok(report)
    }
}

/// Part of a glob before its first metacharacter, used as a list filter.
fn literal_prefix(pattern: &str) -> &str {
    let end = pattern
        .find(|c| matches!(c, '*' | '?' | '['))
        .unwrap_or(pattern.len());
    &pattern[..end]
}

/// Returns false when the container was already gone.
async fn remove_container(
    runtime: &dyn ContainerRuntime,
    id: &str,
    name: &str,
) -> Result<bool, ReconcileError> {
    match runtime.remove_container(id, true).await {
        Ok(()) => {
            debug!(container = %id, name = %name, "Removed stale container");
            Ok(true)
        }
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(removal_error("container", name, e)),
    }
}

async fn remove_network(
    runtime: &dyn ContainerRuntime,
    id: &str,
    name: &str,
) -> Result<bool, ReconcileError> {
    match runtime.remove_network(id).await {
        Ok(()) => {
            debug!(network = %id, name = %name, "Removed stale network");
            Ok(true)
        }
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(removal_error("network", name, e)),
    }
}

fn removal_error(kind: &'static str, name: &str, source: DockerError) -> ReconcileError {
    ReconcileError::RemoveFailed {
        kind,
        name: name.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::MemoryRuntime;
    use crate::pipeline::Tool;

    fn reconciler_for(tool: Tool) -> Reconciler {
        let def = tool.definition();
        Reconciler::new(&def.container_patterns(), &def.network_names()).expect("patterns")
    }

    #[tokio::test]
    async fn test_nothing_to_remove_is_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = MemoryRuntime::new();
        let mut registry = ResourceRegistry::open(dir.path(), "rlimsp").expect("registry");

        let report = reconciler_for(Tool::Rlimsp)
            .run(&runtime, &mut registry)
            .await
            .expect("reconcile");
        assert!(report.is_empty());
    }

    #[tokio::test]
    async fn test_removes_pattern_matches_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = MemoryRuntime::new();
        runtime.seed_container("rlimsp-rlimsp-task_0");
        runtime.seed_container("rlimsp-align-task_7");
        runtime.seed_container("rlimsp-mysql");
        runtime.seed_container("mirtex-mirtex-task_0");
        runtime.seed_network("rlimsp");
        runtime.seed_network("rlimsp_other");
        let mut registry = ResourceRegistry::open(dir.path(), "rlimsp").expect("registry");

        let report = reconciler_for(Tool::Rlimsp)
            .run(&runtime, &mut registry)
            .await
            .expect("reconcile");

        assert_eq!(report.containers_removed, 3);
        assert_eq!(report.networks_removed, 1);
        assert_eq!(
            runtime.live_container_names(),
            vec!["mirtex-mirtex-task_0".to_string()]
        );
        assert_eq!(runtime.live_network_names(), vec!["rlimsp_other".to_string()]);
    }

    #[tokio::test]
    async fn test_registry_entries_removed_and_cleared() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = MemoryRuntime::new();
        let id = runtime.seed_container("custom-name");
        let net = runtime.seed_network("mace2k_net");
        let mut registry = ResourceRegistry::open(dir.path(), "egard").expect("registry");
        registry.begin_run("run-0").expect("begin");
        registry.record_container(&id, "custom-name").expect("record");
        registry.record_network(&net, "mace2k_net").expect("record");
        registry.record_container("gone", "already-removed").expect("record");

        let report = reconciler_for(Tool::Egard)
            .run(&runtime, &mut registry)
            .await
            .expect("reconcile");

        assert_eq!(report.containers_removed, 1);
        assert_eq!(report.networks_removed, 1);
        assert!(runtime.live_container_names().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_invalid_pattern() {
        let result = Reconciler::new(&["rlimsp-[".to_string()], &[]);
        assert!(matches!(result, Err(ReconcileError::InvalidPattern { .. })));
    }

    #[test]
    fn test_literal_prefix() {
        assert_eq!(literal_prefix("rlimsp-*"), "rlimsp-");
        assert_eq!(literal_prefix("mace2k-mysql"), "mace2k-mysql");
        assert_eq!(literal_prefix("*"), "");
    }

    #[test]
    fn test_matches_container() {
        let reconciler = reconciler_for(Tool::Egard);
        assert!(reconciler.matches_container("egard-bionex-task_12"));
        assert!(reconciler.matches_container("mace2k-mysql"));
        assert!(!reconciler.matches_container("rlimsp-mysql"));
    }
}
