//! Process-based runtime for local development.
//!
//! **Warning**: This runtime provides NO isolation and should only be used
//! with trusted computations. The image is ignored; the command runs on the
//! host with the mount points exported as environment variables
//! (`/input` → `CONSORT_INPUT`, and so on).

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::{
    error::ContainerError,
    traits::{ContainerOutput, ContainerRuntime, ContainerSpec},
};

/// Process runtime for development.
///
/// The child is killed when the `run_container` future is dropped, which is
/// how a cancelled step stops it; `stop_and_remove` has nothing left to do.
#[derive(Clone, Debug, Default)]
pub struct ProcessRuntime {
    working_dir: Option<String>,
}

impl ProcessRuntime {
    /// Create a new process runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run commands from this directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

fn mount_env_name(container_path: &str) -> String {
    let trimmed = container_path.trim_matches('/').replace('/', "_");
    format!("CONSORT_{}", trimmed.to_uppercase())
}

#[async_trait]
impl ContainerRuntime for ProcessRuntime {
    #[instrument(skip(self, spec), fields(runtime = "process", name = %spec.name))]
    async fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerOutput, ContainerError> {
        warn!("ProcessRuntime provides NO isolation!");

        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| ContainerError::CreateFailed("empty command".into()))?;
        debug!(program = %program, args = args.len(), "Spawning process");

        let start = Instant::now();
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for mount in &spec.mounts {
            command.env(mount_env_name(&mount.container_path), &mount.host_path);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .map_err(|e| ContainerError::StartFailed(e.to_string()))?;

        #[allow(clippy::cast_possible_truncation)]
        let execution_time_ms = start.elapsed().as_millis() as u64;

        Ok(ContainerOutput {
            exit_code: i64::from(output.status.code().unwrap_or(-1)),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            execution_time_ms,
        })
    }

    async fn stop_and_remove(&self, _name: &str) -> Result<(), ContainerError> {
        Ok(())
    }

    async fn is_ready(&self) -> Result<bool, ContainerError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Mount;

    fn spec(command: &[&str]) -> ContainerSpec {
        ContainerSpec {
            name: "test".into(),
            command: command.iter().map(|s| (*s).to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_simple_command() {
        let runtime = ProcessRuntime::new();
        let result = runtime
            .run_container(&spec(&["echo", "{\"output\":1}"]))
            .await
            .unwrap();

        assert!(result.is_success());
        assert!(result.stdout.contains("\"output\":1"));
    }

    #[tokio::test]
    async fn test_exit_code() {
        let runtime = ProcessRuntime::new();
        let result = runtime
            .run_container(&spec(&["sh", "-c", "exit 42"]))
            .await
            .unwrap();

        assert_eq!(result.exit_code, 42);
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_mounts_exported() {
        let runtime = ProcessRuntime::new();
        let mut spec = spec(&["sh", "-c", "echo $CONSORT_TRANSFER"]);
        spec.mounts.push(Mount::new("/tmp/run-transfer", "/transfer"));

        let result = runtime.run_container(&spec).await.unwrap();
        assert_eq!(result.stdout.trim(), "/tmp/run-transfer");
    }

    #[tokio::test]
    async fn test_empty_command() {
        let runtime = ProcessRuntime::new();
        let result = runtime.run_container(&spec(&[])).await;

        assert!(matches!(result, Err(ContainerError::CreateFailed(_))));
    }

    #[test]
    fn test_mount_env_name() {
        assert_eq!(mount_env_name("/input"), "CONSORT_INPUT");
        assert_eq!(mount_env_name("/data/cache/"), "CONSORT_DATA_CACHE");
    }
}
