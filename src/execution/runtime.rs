//! Container runtime abstraction.
//!
//! The orchestration engine only ever talks to the container engine through
//! [`ContainerRuntime`], which mirrors the handful of calls the engine needs:
//! networks, containers and image pulls.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DockerError;

/// Label key recording which tool created a resource.
pub const TOOL_LABEL: &str = "itextmine.tool";
/// Label key recording which run created a resource.
pub const RUN_LABEL: &str = "itextmine.run";

/// Attachment of a container to a provisioned network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Network name.
    pub network: String,
    /// Static IPv4 address, or `None` to let the engine pick one.
    pub ipv4_address: Option<String>,
}

impl NetworkAttachment {
    /// Attach with an address chosen by the engine.
    pub fn dynamic(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            ipv4_address: None,
        }
    }

    /// Attach at a fixed address.
    pub fn fixed(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            ipv4_address: Some(address.into()),
        }
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Bind mounts in `host:container[:ro]` form.
    pub binds: Vec<String>,
    /// Environment in `KEY=VALUE` form.
    pub env: Vec<String>,
    /// Labels attached to the container.
    pub labels: HashMap<String, String>,
    /// Optional network attachment.
    pub network: Option<NetworkAttachment>,
}

impl ContainerSpec {
    /// Creates a spec for the given name and image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Sets the bind mounts.
    pub fn with_binds(mut self, binds: Vec<String>) -> Self {
        self.binds = binds;
        self
    }

    /// Sets the environment.
    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// Sets the labels.
    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Attaches the container to a network.
    pub fn with_network(mut self, network: NetworkAttachment) -> Self {
        self.network = Some(network);
        self
    }
}

/// A network or container as reported by a list call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSummary {
    /// Engine-assigned id.
    pub id: String,
    /// Name without the leading slash the engine reports for containers.
    pub name: String,
    /// Labels on the resource.
    pub labels: HashMap<String, String>,
}

/// Builds the standard label set for resources created by a run.
pub fn run_labels(tool: &str, run_id: &str) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(TOOL_LABEL.to_string(), tool.to_string());
    labels.insert(RUN_LABEL.to_string(), run_id.to_string());
    labels
}

/// The container engine operations the orchestrator depends on.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates a bridge network with the given subnet. Returns its id.
    async fn create_network(
        &self,
        name: &str,
        subnet: &str,
        labels: &HashMap<String, String>,
    ) -> Result<String, DockerError>;

    /// Removes a network by id or name.
    async fn remove_network(&self, id: &str) -> Result<(), DockerError>;

    /// Lists networks whose name contains `name_filter`.
    async fn list_networks(&self, name_filter: &str) -> Result<Vec<ResourceSummary>, DockerError>;

    /// Creates (but does not start) a container. Returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError>;

    /// Starts a created container.
    async fn start_container(&self, id: &str) -> Result<(), DockerError>;

    /// Blocks until the container stops. Returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, DockerError>;

    /// Removes a container, killing it first when `force` is set.
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError>;

    /// Lists containers, running or not, whose name contains `name_filter`.
    async fn list_containers(
        &self,
        name_filter: &str,
    ) -> Result<Vec<ResourceSummary>, DockerError>;

    /// Pulls an image from its registry.
    async fn pull_image(&self, image: &str) -> Result<(), DockerError>;

    /// Checks if an image exists locally.
    async fn image_exists(&self, image: &str) -> bool;

    /// Returns true while the container is in the running state.
    async fn container_running(&self, id: &str) -> Result<bool, DockerError>;
}
