//! Container execution layer for itextmine.
//!
//! This module isolates every call into the container engine behind the
//! [`ContainerRuntime`] trait, with a bollard-backed implementation for the
//! local Docker daemon and an in-memory one for dry runs and tests.
//!
//! # Architecture
//!
//! Stage containers follow this lifecycle:
//! ```text
//! PENDING → RUNNING → COMPLETED/FAILED/TIMEOUT → REMOVED
//! ```
//!
//! # Example
//!
//! ```ignore
//! use itextmine::execution::{Container, ContainerSpec, DockerClient};
//!
//! let client = DockerClient::new()?;
//! let spec = ContainerSpec::new("mirtex-mirtex-task_0", "itextmine/mirtex");
//!
//! let mut container = Container::create(&client, &spec).await?;
//! container.start(&client).await?;
//! let outcome = container.wait(&client, None).await;
//! container.cleanup(&client).await?;
//! ```

pub mod container;
pub mod docker_client;
pub mod memory;
pub mod runtime;

pub use container::{Container, ContainerStatus, WaitOutcome};
pub use docker_client::DockerClient;
pub use memory::MemoryRuntime;
pub use runtime::{
    run_labels, ContainerRuntime, ContainerSpec, NetworkAttachment, ResourceSummary, RUN_LABEL,
    TOOL_LABEL,
};
