//! Run-wide networks and auxiliary services.
//!
//! [`provision`] creates each declared network, starts its service
//! containers at fixed addresses and waits until every service is ready.
//! Each resource is written to the [`ResourceRegistry`] the moment it is
//! created, and the returned [`Provisioned`] handle owns its teardown. A
//! failure part way through tears down whatever was already created.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::{DockerError, SetupError};
use crate::execution::{Container, ContainerRuntime, ContainerSpec, NetworkAttachment};
use crate::reconcile::ResourceRegistry;

/// Default fixed wait after starting a service.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// A long-lived service container attached to a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    /// Fixed address inside the network's subnet.
    pub ipv4_address: String,
}

impl ServiceSpec {
    pub fn new(name: &str, image: &str, ipv4_address: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            ipv4_address: ipv4_address.to_string(),
        }
    }
}

/// A network and the services attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub subnet: String,
    pub services: Vec<ServiceSpec>,
}

impl NetworkSpec {
    pub fn new(name: &str, subnet: &str) -> Self {
        Self {
            name: name.to_string(),
            subnet: subnet.to_string(),
            services: Vec::new(),
        }
    }

    pub fn with_service(mut self, service: ServiceSpec) -> Self {
        self.services.push(service);
        self
    }
}

/// How a started service is judged ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Readiness {
    /// Wait a fixed interval.
    Grace { millis: u64 },
    /// Poll the container, and optionally a TCP port, with exponential backoff.
    Poll {
        attempts: u32,
        initial_backoff_ms: u64,
        max_backoff_ms: u64,
        #[serde(default)]
        tcp_port: Option<u16>,
    },
}

impl Default for Readiness {
    fn default() -> Self {
        Self::grace(DEFAULT_GRACE)
    }
}

impl Readiness {
    pub fn grace(interval: Duration) -> Self {
        Readiness::Grace {
            millis: interval.as_millis() as u64,
        }
    }

    /// Polling with a 500 ms initial backoff capped at 8 s.
    pub fn poll(attempts: u32, tcp_port: Option<u16>) -> Self {
        Readiness::Poll {
            attempts,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            tcp_port,
        }
    }

    /// Waits until the service is ready.
    pub async fn wait(
        &self,
        runtime: &dyn ContainerRuntime,
        service: &ServiceSpec,
        container_id: &str,
    ) -> Result<(), SetupError> {
        match self {
            Readiness::Grace { millis } => {
                debug!(service = %service.name, millis = millis, "Waiting grace interval");
                tokio::time::sleep(Duration::from_millis(*millis)).await;
                Ok(())
            }
            Readiness::Poll {
                attempts,
                initial_backoff_ms,
                max_backoff_ms,
                tcp_port,
            } => {
                let mut backoff = Duration::from_millis(*initial_backoff_ms);
                let max_backoff = Duration::from_millis(*max_backoff_ms);

                for attempt in 1..=*attempts {
                    if probe(runtime, service, container_id, *tcp_port).await? {
                        debug!(service = %service.name, attempt = attempt, "Service ready");
                        return Ok(());
                    }
                    if attempt < *attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(max_backoff);
                    }
                }

                Err(SetupError::NotReady {
                    name: service.name.clone(),
                    attempts: *attempts,
                })
            }
        }
    }
}

async fn probe(
    runtime: &dyn ContainerRuntime,
    service: &ServiceSpec,
    container_id: &str,
    tcp_port: Option<u16>,
) -> Result<bool, SetupError> {
    let running = runtime
        .container_running(container_id)
        .await
        .map_err(|source| SetupError::Service {
            name: service.name.clone(),
            source,
        })?;
    if !running {
        return Ok(false);
    }

    let Some(port) = tcp_port else {
        return Ok(true);
    };
    let address = format!("{}:{}", service.ipv4_address, port);
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
        Ok(Ok(_)) => Ok(true),
        Ok(Err(e)) => {
            debug!(service = %service.name, address = %address, error = %e, "Service not accepting connections yet");
            Ok(false)
        }
        Err(_) => Ok(false),
    }
}

#[derive(Debug, Clone)]
struct Resource {
    id: String,
    name: String,
}

/// Resources created for a run. Released with [`Provisioned::teardown`].
#[derive(Debug, Default)]
pub struct Provisioned {
    networks: Vec<Resource>,
    services: Vec<Resource>,
    released: bool,
}

impl Provisioned {
    /// Ids of the created networks, in creation order.
    pub fn network_ids(&self) -> Vec<String> {
        self.networks.iter().map(|r| r.id.clone()).collect()
    }

    /// Ids of the started service containers, in creation order.
    pub fn service_ids(&self) -> Vec<String> {
        self.services.iter().map(|r| r.id.clone()).collect()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Removes services, then networks. Safe to call more than once.
    ///
    /// Returns the number of resources that could not be removed; those stay
    /// in the registry for the next reconciliation.
    pub async fn teardown(
        &mut self,
        runtime: &dyn ContainerRuntime,
        registry: &mut ResourceRegistry,
    ) -> usize {
        if self.released {
            return 0;
        }

        let mut failures = 0;

        for service in self.services.drain(..).rev() {
            match runtime.remove_container(&service.id, true).await {
                Ok(()) => {
                    info!(service = %service.name, "Service removed");
                    forget(registry, &service.id);
                }
                Err(e) if e.is_not_found() => forget(registry, &service.id),
                Err(e) => {
                    warn!(service = %service.name, error = %e, "Failed to remove service");
                    failures += 1;
                }
            }
        }

        for network in self.networks.drain(..).rev() {
            match runtime.remove_network(&network.id).await {
                Ok(()) => {
                    info!(network = %network.name, "Network removed");
                    forget(registry, &network.id);
                }
                Err(e) if e.is_not_found() => forget(registry, &network.id),
                Err(e) => {
                    warn!(network = %network.name, error = %e, "Failed to remove network");
                    failures += 1;
                }
            }
        }

        self.released = true;
        failures
    }
}

impl Drop for Provisioned {
    fn drop(&mut self) {
        if !self.released && !(self.networks.is_empty() && self.services.is_empty()) {
            warn!(
                networks = self.networks.len(),
                services = self.services.len(),
                "Provisioned resources dropped without teardown; they remain in the registry"
            );
        }
    }
}

fn forget(registry: &mut ResourceRegistry, id: &str) {
    if let Err(e) = registry.forget(id) {
        warn!(id = %id, error = %e, "Failed to update resource registry");
    }
}

/// Pulls every image up front so no stage pays for a pull.
pub async fn pull_images(runtime: &dyn ContainerRuntime, images: &[String]) -> Result<(), SetupError> {
    for image in images {
        info!(image = %image, "Pulling image");
        runtime
            .pull_image(image)
            .await
            .map_err(|source| SetupError::Pull {
                image: image.clone(),
                source,
            })?;
    }
    Ok(())
}

/// Creates every network and service, waiting for each service to be ready.
pub async fn provision(
    runtime: &dyn ContainerRuntime,
    networks: &[NetworkSpec],
    readiness: &Readiness,
    labels: &HashMap<String, String>,
    registry: &mut ResourceRegistry,
) -> Result<Provisioned, SetupError> {
    let mut provisioned = Provisioned::default();

    match provision_into(&mut provisioned, runtime, networks, readiness, labels, registry).await {
        Ok(()) => Ok(provisioned),
        Err(e) => {
            warn!(error = %e, "Provisioning failed, releasing partial resources");
            provisioned.teardown(runtime, registry).await;
            Err(e)
        }
    }
}

async fn provision_into(
    provisioned: &mut Provisioned,
    runtime: &dyn ContainerRuntime,
    networks: &[NetworkSpec],
    readiness: &Readiness,
    labels: &HashMap<String, String>,
    registry: &mut ResourceRegistry,
) -> Result<(), SetupError> {
    for network in networks {
        let id = runtime
            .create_network(&network.name, &network.subnet, labels)
            .await
            .map_err(|source| network_error(&network.name, source))?;
        provisioned.networks.push(Resource {
            id: id.clone(),
            name: network.name.clone(),
        });
        registry
            .record_network(&id, &network.name)
            .map_err(|e| SetupError::Registry(e.to_string()))?;
        info!(network = %network.name, subnet = %network.subnet, "Network created");

        for service in &network.services {
            let spec = ContainerSpec::new(&service.name, &service.image)
                .with_labels(labels.clone())
                .with_network(NetworkAttachment::fixed(&network.name, &service.ipv4_address));

            let mut container = Container::create(runtime, &spec)
                .await
                .map_err(|source| service_error(&service.name, source))?;
            provisioned.services.push(Resource {
                id: container.id().to_string(),
                name: service.name.clone(),
            });
            registry
                .record_container(container.id(), &service.name)
                .map_err(|e| SetupError::Registry(e.to_string()))?;

            container
                .start(runtime)
                .await
                .map_err(|source| service_error(&service.name, source))?;
            debug!(service = %service.name, container = %container.id(), "Service started");

            readiness.wait(runtime, service, container.id()).await?;
            info!(service = %service.name, address = %service.ipv4_address, "Service ready");
        }
    }

    Ok(())
}

fn network_error(name: &str, source: DockerError) -> SetupError {
    if source.is_conflict() {
        SetupError::ResourceConflict {
            name: name.to_string(),
        }
    } else {
        SetupError::Network {
            name: name.to_string(),
            source,
        }
    }
}

fn service_error(name: &str, source: DockerError) -> SetupError {
    if source.is_conflict() {
        SetupError::ResourceConflict {
            name: name.to_string(),
        }
    } else {
        SetupError::Service {
            name: name.to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{run_labels, MemoryRuntime};
    use crate::pipeline::Tool;

    fn quick() -> Readiness {
        Readiness::grace(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_provision_and_teardown_egard() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = MemoryRuntime::new();
        let mut registry = ResourceRegistry::open(dir.path(), "egard").expect("registry");
        let networks = Tool::Egard.definition().networks;

        let mut provisioned = provision(
            &runtime,
            &networks,
            &quick(),
            &run_labels("egard", "run-1"),
            &mut registry,
        )
        .await
        .expect("provision");

        assert_eq!(provisioned.network_ids().len(), 2);
        assert_eq!(provisioned.service_ids().len(), 2);
        assert_eq!(registry.networks().len(), 2);
        assert_eq!(registry.containers().len(), 2);
        let spec = runtime.spec_of("mace2k-mysql").expect("service");
        assert_eq!(
            spec.network.and_then(|n| n.ipv4_address),
            Some("192.168.0.2".to_string())
        );

        assert_eq!(provisioned.teardown(&runtime, &mut registry).await, 0);
        assert_eq!(provisioned.teardown(&runtime, &mut registry).await, 0);
        assert!(runtime.live_container_names().is_empty());
        assert!(runtime.live_network_names().is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_existing_network_is_conflict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = MemoryRuntime::new();
        runtime.seed_network("rlimsp");
        let mut registry = ResourceRegistry::open(dir.path(), "rlimsp").expect("registry");

        let err = provision(
            &runtime,
            &Tool::Rlimsp.definition().networks,
            &quick(),
            &HashMap::new(),
            &mut registry,
        )
        .await
        .expect_err("conflict");

        assert!(matches!(err, SetupError::ResourceConflict { ref name } if name == "rlimsp"));
    }

    #[tokio::test]
    async fn test_service_failure_releases_network() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = MemoryRuntime::new();
        runtime.fail_start("rlimsp-mysql");
        let mut registry = ResourceRegistry::open(dir.path(), "rlimsp").expect("registry");

        let err = provision(
            &runtime,
            &Tool::Rlimsp.definition().networks,
            &quick(),
            &HashMap::new(),
            &mut registry,
        )
        .await
        .expect_err("service failure");

        assert!(matches!(err, SetupError::Service { .. }));
        assert!(runtime.live_network_names().is_empty());
        assert!(runtime.live_container_names().is_empty());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_poll_readiness_exhausts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = MemoryRuntime::new();
        runtime.never_ready("rlimsp-mysql");
        let mut registry = ResourceRegistry::open(dir.path(), "rlimsp").expect("registry");
        let readiness = Readiness::Poll {
            attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            tcp_port: None,
        };

        let err = provision(
            &runtime,
            &Tool::Rlimsp.definition().networks,
            &readiness,
            &HashMap::new(),
            &mut registry,
        )
        .await
        .expect_err("not ready");

        assert!(matches!(err, SetupError::NotReady { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_poll_readiness_succeeds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = MemoryRuntime::new();
        let mut registry = ResourceRegistry::open(dir.path(), "rlimsp").expect("registry");

        let mut provisioned = provision(
            &runtime,
            &Tool::Rlimsp.definition().networks,
            &Readiness::poll(2, None),
            &HashMap::new(),
            &mut registry,
        )
        .await
        .expect("provision");
        provisioned.teardown(&runtime, &mut registry).await;
    }

    #[tokio::test]
    async fn test_pull_images_in_order() {
        let runtime = MemoryRuntime::new();
        let images = Tool::Mirtex.definition().images();
        pull_images(&runtime, &images).await.expect("pull");
        assert_eq!(runtime.pulled_images(), images);
    }

    #[test]
    fn test_readiness_yaml() {
        let readiness: Readiness = serde_yaml::from_str(
            "mode: poll\nattempts: 10\ninitial_backoff_ms: 250\nmax_backoff_ms: 4000\ntcp_port: 3306\n",
        )
        .expect("parse");
        assert_eq!(
            readiness,
            Readiness::Poll {
                attempts: 10,
                initial_backoff_ms: 250,
                max_backoff_ms: 4000,
                tcp_port: Some(3306),
            }
        );
        assert_eq!(Readiness::default(), Readiness::Grace { millis: 5000 });
    }
}
