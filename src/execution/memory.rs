//! In-memory container runtime.
//!
//! [`MemoryRuntime`] implements [`ContainerRuntime`] without a container
//! engine. Every "container" simulates its tool by writing a one-line
//! placeholder into each writable bind mount when waited on. It backs the
//! `--dry-run` mode of the CLI and the test suites, and supports failure
//! injection keyed by container name.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DockerError;
use crate::execution::runtime::{ContainerRuntime, ContainerSpec, ResourceSummary};

#[derive(Debug, Clone)]
struct MemoryContainer {
    spec: ContainerSpec,
    running: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    containers: HashMap<String, MemoryContainer>,
    networks: HashMap<String, ResourceSummary>,
    removals: HashMap<String, usize>,
    removed_names: Vec<String>,
    created_names: Vec<String>,
    pulled: Vec<String>,
    local_images: HashSet<String>,
    create_failures: HashSet<String>,
    start_failures: HashSet<String>,
    empty_outputs: HashSet<String>,
    exit_codes: HashMap<String, i64>,
    wait_delays: HashMap<String, Duration>,
    default_delay: Duration,
    never_ready: HashSet<String>,
    active: usize,
    max_active: usize,
}

/// A container runtime that keeps all state in memory.
#[derive(Debug, Default)]
pub struct MemoryRuntime {
    state: Mutex<MemoryState>,
}

impl MemoryRuntime {
    /// Creates an empty runtime.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Makes creation of the named container fail.
    pub fn fail_create(&self, name: &str) {
        self.with_state(|s| s.create_failures.insert(name.to_string()));
    }

    /// Makes start of the named container fail.
    pub fn fail_start(&self, name: &str) {
        self.with_state(|s| s.start_failures.insert(name.to_string()));
    }

    /// The named container exits without writing its outputs.
    pub fn produce_empty_output(&self, name: &str) {
        self.with_state(|s| s.empty_outputs.insert(name.to_string()));
    }

    /// The named container exits with the given code.
    pub fn set_exit_code(&self, name: &str, code: i64) {
        self.with_state(|s| s.exit_codes.insert(name.to_string(), code));
    }

    /// The named container runs for `delay` before exiting.
    pub fn set_wait_delay(&self, name: &str, delay: Duration) {
        self.with_state(|s| s.wait_delays.insert(name.to_string(), delay));
    }

    /// Every container runs for `delay` unless configured otherwise.
    pub fn set_default_delay(&self, delay: Duration) {
        self.with_state(|s| s.default_delay = delay);
    }

    /// The named container never reports as running.
    pub fn never_ready(&self, name: &str) {
        self.with_state(|s| s.never_ready.insert(name.to_string()));
    }

    /// Seeds a container as if left over by an earlier run.
    pub fn seed_container(&self, name: &str) -> String {
        self.with_state(|s| {
            s.next_id += 1;
            let id = format!("mem-{}", s.next_id);
            s.containers.insert(
                id.clone(),
                MemoryContainer {
                    spec: ContainerSpec::new(name, "seeded"),
                    running: true,
                },
            );
            id
        })
    }

    /// Seeds a network as if left over by an earlier run.
    pub fn seed_network(&self, name: &str) -> String {
        self.with_state(|s| {
            s.next_id += 1;
            let id = format!("net-{}", s.next_id);
            s.networks.insert(
                id.clone(),
                ResourceSummary {
                    id: id.clone(),
                    name: name.to_string(),
                    labels: HashMap::new(),
                },
            );
            id
        })
    }

    /// Number of times the container with this id was removed.
    pub fn remove_count(&self, id: &str) -> usize {
        self.with_state(|s| s.removals.get(id).copied().unwrap_or(0))
    }

    /// Names of all containers created so far, in creation order.
    pub fn created_names(&self) -> Vec<String> {
        self.with_state(|s| s.created_names.clone())
    }

    /// Names of all containers removed so far, in removal order.
    pub fn removed_names(&self) -> Vec<String> {
        self.with_state(|s| s.removed_names.clone())
    }

    /// Images pulled so far.
    pub fn pulled_images(&self) -> Vec<String> {
        self.with_state(|s| s.pulled.clone())
    }

    /// Names of containers still known to the runtime.
    pub fn live_container_names(&self) -> Vec<String> {
        self.with_state(|s| {
            let mut names: Vec<String> =
                s.containers.values().map(|c| c.spec.name.clone()).collect();
            names.sort();
            names
        })
    }

    /// Names of networks still known to the runtime.
    pub fn live_network_names(&self) -> Vec<String> {
        self.with_state(|s| {
            let mut names: Vec<String> = s.networks.values().map(|n| n.name.clone()).collect();
            names.sort();
            names
        })
    }

    /// Spec of a live container, by name.
    pub fn spec_of(&self, name: &str) -> Option<ContainerSpec> {
        self.with_state(|s| {
            s.containers
                .values()
                .find(|c| c.spec.name == name)
                .map(|c| c.spec.clone())
        })
    }

    /// Highest number of containers observed running at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.with_state(|s| s.max_active)
    }
}

/// Writes a placeholder line into every writable bind that points at a file.
fn write_outputs(spec: &ContainerSpec) -> Result<(), DockerError> {
    for bind in &spec.binds {
        let mut parts = bind.split(':');
        let host = parts.next().unwrap_or_default();
        let _container_path = parts.next();
        if parts.next() == Some("ro") {
            continue;
        }
        let host = Path::new(host);
        if host.is_file() {
            std::fs::write(host, format!("{}\n", spec.name))
                .map_err(|e| DockerError::RunFailed(format!("simulated write failed: {e}")))?;
        }
    }
    Ok(())
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn create_network(
        &self,
        name: &str,
        _subnet: &str,
        labels: &HashMap<String, String>,
    ) -> Result<String, DockerError> {
        self.with_state(|s| {
            if s.networks.values().any(|n| n.name == name) {
                return Err(DockerError::Conflict {
                    name: name.to_string(),
                });
            }
            s.next_id += 1;
            let id = format!("net-{}", s.next_id);
            s.networks.insert(
                id.clone(),
                ResourceSummary {
                    id: id.clone(),
                    name: name.to_string(),
                    labels: labels.clone(),
                },
            );
            Ok(id)
        })
    }

    async fn remove_network(&self, id: &str) -> Result<(), DockerError> {
        self.with_state(|s| {
            let key = s
                .networks
                .iter()
                .find(|(key, n)| key.as_str() == id || n.name == id)
                .map(|(key, _)| key.clone());
            match key {
                Some(key) => {
                    s.networks.remove(&key);
                    Ok(())
                }
                None => Err(DockerError::ContainerNotFound { id: id.to_string() }),
            }
        })
    }

    async fn list_networks(&self, filter: &str) -> Result<Vec<ResourceSummary>, DockerError> {
        Ok(self.with_state(|s| {
            s.networks
                .values()
                .filter(|n| n.name.contains(filter))
                .cloned()
                .collect()
        }))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        self.with_state(|s| {
            if s.create_failures.contains(&spec.name) {
                return Err(DockerError::CreateFailed {
                    name: spec.name.clone(),
                    reason: "injected failure".to_string(),
                });
            }
            if s.containers.values().any(|c| c.spec.name == spec.name) {
                return Err(DockerError::Conflict {
                    name: spec.name.clone(),
                });
            }
            if let Some(network) = &spec.network {
                if !s.networks.values().any(|n| n.name == network.network) {
                    return Err(DockerError::NetworkFailed(format!(
                        "network '{}' not found",
                        network.network
                    )));
                }
            }
            s.next_id += 1;
            let id = format!("mem-{}", s.next_id);
            s.containers.insert(
                id.clone(),
                MemoryContainer {
                    spec: spec.clone(),
                    running: false,
                },
            );
            s.created_names.push(spec.name.clone());
            Ok(id)
        })
    }

    async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.with_state(|s| {
            let container = s
                .containers
                .get_mut(id)
                .ok_or_else(|| DockerError::ContainerNotFound { id: id.to_string() })?;
            if s.start_failures.contains(&container.spec.name) {
                return Err(DockerError::RunFailed("injected start failure".to_string()));
            }
            container.running = true;
            s.active += 1;
            s.max_active = s.max_active.max(s.active);
            Ok(())
        })
    }

    async fn wait_container(&self, id: &str) -> Result<i64, DockerError> {
        let (spec, delay) = self.with_state(|s| {
            let container = s
                .containers
                .get(id)
                .ok_or_else(|| DockerError::ContainerNotFound { id: id.to_string() })?;
            let delay = s
                .wait_delays
                .get(&container.spec.name)
                .copied()
                .unwrap_or(s.default_delay);
            Ok::<_, DockerError>((container.spec.clone(), delay))
        })?;

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let (write, code) = self.with_state(|s| {
            if let Some(container) = s.containers.get_mut(id) {
                if container.running {
                    container.running = false;
                    s.active = s.active.saturating_sub(1);
                }
            }
            (
                !s.empty_outputs.contains(&spec.name),
                s.exit_codes.get(&spec.name).copied().unwrap_or(0),
            )
        });

        if write {
            write_outputs(&spec)?;
        }
        Ok(code)
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<(), DockerError> {
        self.with_state(|s| match s.containers.remove(id) {
            Some(container) => {
                if container.running {
                    s.active = s.active.saturating_sub(1);
                }
                *s.removals.entry(id.to_string()).or_insert(0) += 1;
                s.removed_names.push(container.spec.name);
                Ok(())
            }
            None => Err(DockerError::ContainerNotFound { id: id.to_string() }),
        })
    }

    async fn list_containers(&self, filter: &str) -> Result<Vec<ResourceSummary>, DockerError> {
        Ok(self.with_state(|s| {
            s.containers
                .iter()
                .filter(|(_, c)| c.spec.name.contains(filter))
                .map(|(id, c)| ResourceSummary {
                    id: id.clone(),
                    name: c.spec.name.clone(),
                    labels: c.spec.labels.clone(),
                })
                .collect()
        }))
    }

    async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        self.with_state(|s| {
            s.pulled.push(image.to_string());
            s.local_images.insert(image.to_string());
        });
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> bool {
        self.with_state(|s| s.local_images.contains(image))
    }

    async fn container_running(&self, id: &str) -> Result<bool, DockerError> {
        self.with_state(|s| {
            let container = s
                .containers
                .get(id)
                .ok_or_else(|| DockerError::ContainerNotFound { id: id.to_string() })?;
            Ok(container.running && !s.never_ready.contains(&container.spec.name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_writes_writable_binds_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("input.json");
        let output = dir.path().join("output.json");
        std::fs::write(&input, "doc\n").expect("write input");
        std::fs::write(&output, "").expect("touch output");

        let runtime = MemoryRuntime::new();
        let spec = ContainerSpec::new("mirtex-mirtex-task_0", "itextmine/mirtex").with_binds(vec![
            format!("{}:/mirtex_workdir/in.json:ro", input.display()),
            format!("{}:/mirtex_workdir/out.json", output.display()),
        ]);
        let id = runtime.create_container(&spec).await.expect("create");
        runtime.start_container(&id).await.expect("start");
        assert_eq!(runtime.wait_container(&id).await.expect("wait"), 0);

        assert_eq!(std::fs::read_to_string(&input).expect("read"), "doc\n");
        assert_eq!(
            std::fs::read_to_string(&output).expect("read"),
            "mirtex-mirtex-task_0\n"
        );
    }

    #[tokio::test]
    async fn test_network_conflict_and_listing() {
        let runtime = MemoryRuntime::new();
        runtime
            .create_network("rlimsp", "10.0.0.0/16", &HashMap::new())
            .await
            .expect("create");
        let err = runtime
            .create_network("rlimsp", "10.0.0.0/16", &HashMap::new())
            .await
            .expect_err("duplicate");
        assert!(err.is_conflict());
        assert_eq!(runtime.list_networks("rlim").await.expect("list").len(), 1);
    }
}
