//! Lifecycle handle for a single disposable container.
//!
//! A [`Container`] tracks one container from creation to removal and makes
//! removal idempotent, so callers can issue cleanup on every exit path
//! without risking a double remove.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DockerError;
use crate::execution::runtime::{ContainerRuntime, ContainerSpec};

/// Status of a managed container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerStatus {
    /// Created but not started.
    Pending,
    /// Container is running.
    Running,
    /// Container exited with status 0.
    Completed,
    /// Container failed with an error message.
    Failed(String),
    /// Container exceeded its deadline.
    Timeout,
    /// Container has been removed from the engine.
    Removed,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Pending => write!(f, "pending"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Completed => write!(f, "completed"),
            ContainerStatus::Failed(msg) => write!(f, "failed: {}", msg),
            ContainerStatus::Timeout => write!(f, "timeout"),
            ContainerStatus::Removed => write!(f, "removed"),
        }
    }
}

/// How a wait on a container ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The container stopped with this exit code.
    Exited(i64),
    /// The deadline expired first. The container may still be running.
    TimedOut,
}

/// A managed container with lifecycle tracking.
#[derive(Debug)]
pub struct Container {
    id: String,
    name: String,
    status: ContainerStatus,
}

impl Container {
    /// Creates the container in the engine without starting it.
    ///
    /// The image is pulled first if it is not present locally.
    pub async fn create(
        runtime: &dyn ContainerRuntime,
        spec: &ContainerSpec,
    ) -> Result<Self, DockerError> {
        if !runtime.image_exists(&spec.image).await {
            runtime.pull_image(&spec.image).await?;
        }

        let id = runtime.create_container(spec).await?;

        Ok(Self {
            id,
            name: spec.name.clone(),
            status: ContainerStatus::Pending,
        })
    }

    /// Starts the container.
    pub async fn start(&mut self, runtime: &dyn ContainerRuntime) -> Result<(), DockerError> {
        if self.status != ContainerStatus::Pending {
            return Err(DockerError::RunFailed(format!(
                "Cannot start container {} in {} state",
                self.name, self.status
            )));
        }

        match runtime.start_container(&self.id).await {
            Ok(()) => {
                self.status = ContainerStatus::Running;
                Ok(())
            }
            Err(e) => {
                self.status = ContainerStatus::Failed(format!("Start failed: {}", e));
                Err(e)
            }
        }
    }

    /// Waits for the container to stop, optionally bounded by a deadline.
    pub async fn wait(
        &mut self,
        runtime: &dyn ContainerRuntime,
        deadline: Option<Duration>,
    ) -> Result<WaitOutcome, DockerError> {
        let exit_code = match deadline {
            Some(limit) => match tokio::time::timeout(limit, runtime.wait_container(&self.id)).await
            {
                Ok(result) => result,
                Err(_) => {
                    self.status = ContainerStatus::Timeout;
                    return Ok(WaitOutcome::TimedOut);
                }
            },
            None => runtime.wait_container(&self.id).await,
        };

        match exit_code {
            Ok(code) => {
                self.status = if code == 0 {
                    ContainerStatus::Completed
                } else {
                    ContainerStatus::Failed(format!("Exited with code {}", code))
                };
                Ok(WaitOutcome::Exited(code))
            }
            Err(e) => {
                self.status = ContainerStatus::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Force-removes the container. Calling this again is a no-op.
    ///
    /// A container the engine no longer knows about counts as removed.
    pub async fn cleanup(&mut self, runtime: &dyn ContainerRuntime) -> Result<(), DockerError> {
        if self.status == ContainerStatus::Removed {
            return Ok(());
        }

        match runtime.remove_container(&self.id, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        self.status = ContainerStatus::Removed;
        Ok(())
    }

    /// Returns the container ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the current status.
    pub fn status(&self) -> &ContainerStatus {
        &self.status
    }

    /// Checks if the container was removed.
    pub fn is_removed(&self) -> bool {
        self.status == ContainerStatus::Removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::memory::MemoryRuntime;

    #[test]
    fn test_container_status_display() {
        assert_eq!(format!("{}", ContainerStatus::Pending), "pending");
        assert_eq!(format!("{}", ContainerStatus::Running), "running");
        assert_eq!(format!("{}", ContainerStatus::Completed), "completed");
        assert_eq!(format!("{}", ContainerStatus::Timeout), "timeout");
        assert_eq!(format!("{}", ContainerStatus::Removed), "removed");
        assert_eq!(
            format!("{}", ContainerStatus::Failed("error".to_string())),
            "failed: error"
        );
    }

    #[tokio::test]
    async fn test_lifecycle_and_idempotent_cleanup() {
        let runtime = MemoryRuntime::new();
        let spec = ContainerSpec::new("mirtex-mirtex-task_0", "itextmine/mirtex");

        let mut container = Container::create(&runtime, &spec).await.expect("create");
        assert_eq!(container.status(), &ContainerStatus::Pending);

        container.start(&runtime).await.expect("start");
        assert!(matches!(container.status(), ContainerStatus::Running));

        let outcome = container.wait(&runtime, None).await.expect("wait");
        assert_eq!(outcome, WaitOutcome::Exited(0));
        assert_eq!(container.status(), &ContainerStatus::Completed);

        container.cleanup(&runtime).await.expect("cleanup");
        container.cleanup(&runtime).await.expect("second cleanup");
        assert!(container.is_removed());
        assert_eq!(runtime.remove_count(container.id()), 1);
    }

    #[tokio::test]
    async fn test_wait_deadline_reports_timeout() {
        let runtime = MemoryRuntime::new();
        runtime.set_wait_delay("slow", Duration::from_secs(5));
        let spec = ContainerSpec::new("slow", "img");

        let mut container = Container::create(&runtime, &spec).await.expect("create");
        container.start(&runtime).await.expect("start");
        let outcome = container
            .wait(&runtime, Some(Duration::from_millis(20)))
            .await
            .expect("wait");

        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(container.status(), &ContainerStatus::Timeout);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let runtime = MemoryRuntime::new();
        let spec = ContainerSpec::new("once", "img");
        let mut container = Container::create(&runtime, &spec).await.expect("create");
        container.start(&runtime).await.expect("start");
        assert!(container.start(&runtime).await.is_err());
    }
}
