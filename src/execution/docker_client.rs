//! Docker API wrapper using the bollard crate.
//!
//! Implements [`ContainerRuntime`] on top of the local Docker daemon.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use futures::StreamExt;
use tracing::debug;

use crate::error::DockerError;
use crate::execution::runtime::{ContainerRuntime, ContainerSpec, ResourceSummary};

/// Docker client wrapper for container and network operations.
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Creates a new Docker client connecting to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `DockerError::DaemonUnavailable` if the Docker daemon is not accessible.
    pub fn new() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Verifies the daemon answers a ping.
    pub async fn ping(&self) -> Result<(), DockerError> {
        self.docker
            .ping()
            .await
            .map_err(|e| DockerError::DaemonUnavailable(e.to_string()))?;
        Ok(())
    }
}

/// Maps conflict and not-found responses onto their dedicated variants.
fn classify(err: BollardError, name: &str, fallback: impl FnOnce(String) -> DockerError) -> DockerError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 409, ..
        } => DockerError::Conflict {
            name: name.to_string(),
        },
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => DockerError::ContainerNotFound {
            id: name.to_string(),
        },
        other => fallback(other.to_string()),
    }
}

fn name_filter(name: &str) -> HashMap<String, Vec<String>> {
    let mut filters = HashMap::new();
    if !name.is_empty() {
        filters.insert("name".to_string(), vec![name.to_string()]);
    }
    filters
}

/// Builds the network section of a container config.
fn networking_config(spec: &ContainerSpec) -> Option<NetworkingConfig<String>> {
    let attachment = spec.network.as_ref()?;

    let endpoint = EndpointSettings {
        ipam_config: attachment
            .ipv4_address
            .as_ref()
            .map(|address| EndpointIpamConfig {
                ipv4_address: Some(address.clone()),
                ..Default::default()
            }),
        ..Default::default()
    };

    let mut endpoints_config = HashMap::new();
    endpoints_config.insert(attachment.network.clone(), endpoint);

    Some(NetworkingConfig { endpoints_config })
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn create_network(
        &self,
        name: &str,
        subnet: &str,
        labels: &HashMap<String, String>,
    ) -> Result<String, DockerError> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            check_duplicate: true,
            driver: "bridge".to_string(),
            ipam: Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(subnet.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            labels: labels.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_network(options)
            .await
            .map_err(|e| classify(e, name, DockerError::NetworkFailed))?;

        response
            .id
            .ok_or_else(|| DockerError::NetworkFailed(format!("No id returned for network '{name}'")))
    }

    async fn remove_network(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .remove_network(id)
            .await
            .map_err(|e| {
                classify(e, id, |reason| DockerError::RemoveFailed {
                    id: id.to_string(),
                    reason,
                })
            })
    }

    async fn list_networks(&self, filter: &str) -> Result<Vec<ResourceSummary>, DockerError> {
        let options = ListNetworksOptions {
            filters: name_filter(filter),
        };

        let networks = self
            .docker
            .list_networks(Some(options))
            .await
            .map_err(|e| DockerError::NetworkFailed(format!("Failed to list networks: {e}")))?;

        Ok(networks
            .into_iter()
            .map(|network| ResourceSummary {
                id: network.id.unwrap_or_default(),
                name: network.name.unwrap_or_default(),
                labels: network.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        let host_config = HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            networking_config: networking_config(spec),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| {
                classify(e, &spec.name, |reason| DockerError::CreateFailed {
                    name: spec.name.clone(),
                    reason,
                })
            })?;

        debug!(container = %response.id, name = %spec.name, "Container created");
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to start container: {e}")))?;

        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, DockerError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(DockerError::RunFailed(format!(
                "Error waiting for container: {e}"
            ))),
            None => Err(DockerError::RunFailed(
                "Wait stream ended without a status".to_string(),
            )),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| {
                classify(e, id, |reason| DockerError::RemoveFailed {
                    id: id.to_string(),
                    reason,
                })
            })?;

        Ok(())
    }

    async fn list_containers(&self, filter: &str) -> Result<Vec<ResourceSummary>, DockerError> {
        let options = ListContainersOptions {
            all: true,
            filters: name_filter(filter),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| DockerError::RunFailed(format!("Failed to list containers: {e}")))?;

        Ok(containers
            .into_iter()
            .map(|container| ResourceSummary {
                id: container.id.unwrap_or_default(),
                name: container
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|name| name.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                labels: container.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn pull_image(&self, image: &str) -> Result<(), DockerError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| DockerError::PullFailed {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
            if let Some(status) = info.status {
                debug!(image = image, status = %status, "Pull progress");
            }
        }

        Ok(())
    }

    async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    async fn container_running(&self, id: &str) -> Result<bool, DockerError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                classify(e, id, |reason| {
                    DockerError::RunFailed(format!("Failed to inspect container: {reason}"))
                })
            })?;

        Ok(info
            .state
            .and_then(|state| state.running)
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::runtime::NetworkAttachment;

    #[test]
    fn test_name_filter_empty() {
        assert!(name_filter("").is_empty());
        let filters = name_filter("rlimsp");
        assert_eq!(filters.get("name"), Some(&vec!["rlimsp".to_string()]));
    }

    #[test]
    fn test_networking_config_fixed_address() {
        let spec = ContainerSpec::new("svc", "mysql")
            .with_network(NetworkAttachment::fixed("rlimsp", "10.0.0.2"));
        let config = networking_config(&spec).expect("network config");
        let endpoint = config.endpoints_config.get("rlimsp").expect("endpoint");
        assert_eq!(
            endpoint
                .ipam_config
                .as_ref()
                .and_then(|ipam| ipam.ipv4_address.clone()),
            Some("10.0.0.2".to_string())
        );
    }

    #[test]
    fn test_networking_config_dynamic_and_absent() {
        let spec = ContainerSpec::new("stage", "img")
            .with_network(NetworkAttachment::dynamic("mace2k_net"));
        let config = networking_config(&spec).expect("network config");
        let endpoint = config.endpoints_config.get("mace2k_net").expect("endpoint");
        assert!(endpoint.ipam_config.is_none());

        let bare = ContainerSpec::new("stage", "img");
        assert!(networking_config(&bare).is_none());
    }

    #[test]
    fn test_classify_conflict() {
        let err = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "name in use".to_string(),
        };
        let mapped = classify(err, "rlimsp-mysql", DockerError::RunFailed);
        assert!(mapped.is_conflict());
    }
}
