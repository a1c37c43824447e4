//! Runtime traits and types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ContainerError;

/// A host directory bound into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Absolute path on the host
    pub host_path: String,
    /// Mount point inside the container
    pub container_path: String,
    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    /// Create a read-write mount.
    #[must_use]
    pub fn new(host_path: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }

    /// Mark the mount read-only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Docker `Binds` notation (`host:container[:ro]`).
    #[must_use]
    pub fn to_bind(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.host_path, self.container_path)
        } else {
            format!("{}:{}", self.host_path, self.container_path)
        }
    }
}

/// Everything a runtime needs to run one computation container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name, also the handle used by `stop_and_remove`
    pub name: String,
    /// Image reference
    pub image: String,
    /// Command and arguments
    pub command: Vec<String>,
    /// Bind mounts
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Environment variables
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Extra engine host configuration, merged over the generated one
    #[serde(default)]
    pub host_config: Option<serde_json::Value>,
}

impl ContainerSpec {
    /// Host path mounted at `container_path`, if any.
    #[must_use]
    pub fn host_path_for(&self, container_path: &str) -> Option<&str> {
        self.mounts
            .iter()
            .find(|m| m.container_path == container_path)
            .map(|m| m.host_path.as_str())
    }
}

/// Collected output of a finished container.
#[derive(Debug, Clone, Default)]
pub struct ContainerOutput {
    /// Exit code reported by the runtime
    pub exit_code: i64,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Wall time in milliseconds
    pub execution_time_ms: u64,
}

impl ContainerOutput {
    /// Exit code zero and nothing written to stderr.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.stderr.is_empty()
    }
}

/// Trait for container runtimes.
///
/// A runtime starts a container, waits for its output stream to close and
/// hands back what it wrote. The engine layer above never talks to a
/// container daemon directly.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Run a container to completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the container could not be created, started or
    /// read. A container that runs and exits non-zero is *not* an error at
    /// this layer; inspect [`ContainerOutput`].
    async fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerOutput, ContainerError>;

    /// Stop and remove a container by name. Unknown names are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime refused the request.
    async fn stop_and_remove(&self, name: &str) -> Result<(), ContainerError>;

    /// Check if the runtime is reachable.
    ///
    /// # Errors
    ///
    /// Returns an error if the check itself could not be performed.
    async fn is_ready(&self) -> Result<bool, ContainerError>;
}

#[async_trait]
impl<T: ContainerRuntime + ?Sized> ContainerRuntime for std::sync::Arc<T> {
    async fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerOutput, ContainerError> {
        (**self).run_container(spec).await
    }

    async fn stop_and_remove(&self, name: &str) -> Result<(), ContainerError> {
        (**self).stop_and_remove(name).await
    }

    async fn is_ready(&self) -> Result<bool, ContainerError> {
        (**self).is_ready().await
    }
}
