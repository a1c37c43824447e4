//! Docker Engine runtime.
//!
//! Talks to the engine's HTTP API (`DOCKER_HOST=tcp://…` style endpoints).
//! A computation container is created, started, waited on, and its
//! multiplexed log stream is fed through a [`FrameDemuxer`] before the
//! container is removed.
//!
//! # Example
//!
//! ```rust,no_run
//! use consort_container::{ContainerRuntime, ContainerSpec, DockerRuntime};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = DockerRuntime::new("http://localhost:2375")
//!         .api_version("v1.43")
//!         .build();
//!
//!     let spec = ContainerSpec {
//!         name: "consort-demo".into(),
//!         image: "alpine:3".into(),
//!         command: vec!["echo".into(), "{}".into()],
//!         ..Default::default()
//!     };
//!     let out = runtime.run_container(&spec).await?;
//!     println!("Output: {}", out.stdout);
//!
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::demux::FrameDemuxer;
use crate::error::ContainerError;
use crate::traits::{ContainerOutput, ContainerRuntime, ContainerSpec};

const PORT_ALLOCATED: &str = "port is already allocated";
const START_JITTER_MS: u64 = 200;

/// Configuration for [`DockerRuntime`].
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Engine endpoint, e.g. `http://localhost:2375`
    pub base_url: String,
    /// Optional API version prefix, e.g. `v1.43`
    pub api_version: Option<String>,
    /// Grace period handed to `stop` before the engine kills the container
    pub stop_timeout_secs: u64,
    /// How often a start that hit a port clash is retried
    pub max_start_retries: u32,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:2375".to_string(),
            api_version: None,
            stop_timeout_secs: 5,
            max_start_retries: 500,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WaitResponse {
    #[serde(rename = "StatusCode")]
    status_code: i64,
}

/// Docker Engine backed runtime.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    config: DockerConfig,
    client: Client,
}

impl DockerRuntime {
    /// Create a new Docker runtime builder.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> DockerRuntimeBuilder {
        DockerRuntimeBuilder {
            config: DockerConfig {
                base_url: base_url.into(),
                ..Default::default()
            },
        }
    }

    /// Create with full config.
    #[must_use]
    pub fn with_config(config: DockerConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match &self.config.api_version {
            Some(version) => format!("{base}/{version}{path}"),
            None => format!("{base}{path}"),
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<(), ContainerError> {
        let body = create_body(spec);
        let mut retried_conflict = false;

        loop {
            let response = self
                .client
                .post(self.url("/containers/create"))
                .query(&[("name", spec.name.as_str())])
                .json(&body)
                .send()
                .await
                .map_err(|e| ContainerError::ConnectionFailed(e.to_string()))?;

            match response.status() {
                StatusCode::CREATED | StatusCode::OK => return Ok(()),
                // A stale container with the same name from an aborted run
                StatusCode::CONFLICT if !retried_conflict => {
                    warn!(name = %spec.name, "Removing stale container with the same name");
                    retried_conflict = true;
                    self.remove(&spec.name).await?;
                }
                status => {
                    let text = response.text().await.unwrap_or_default();
                    return Err(ContainerError::CreateFailed(format!("{status}: {text}")));
                }
            }
        }
    }

    async fn start(&self, name: &str) -> Result<(), ContainerError> {
        let response = self
            .client
            .post(self.url(&format!("/containers/{name}/start")))
            .send()
            .await
            .map_err(|e| ContainerError::ConnectionFailed(e.to_string()))?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED | StatusCode::OK => Ok(()),
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(ContainerError::StartFailed(format!("{status}: {text}")))
            }
        }
    }

    /// Create and start, retrying port clashes that happen when several
    /// containers come up at once.
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<(), ContainerError> {
        let mut attempts = 0;

        loop {
            self.create(spec).await?;

            match self.start(&spec.name).await {
                Ok(()) => return Ok(()),
                Err(ContainerError::StartFailed(msg))
                    if msg.contains(PORT_ALLOCATED) && attempts < self.config.max_start_retries =>
                {
                    attempts += 1;
                    self.remove(&spec.name).await?;
                    let jitter = rand::thread_rng().gen_range(0..START_JITTER_MS);
                    debug!(name = %spec.name, attempts, jitter_ms = jitter, "Port clash, retrying start");
                    tokio::time::sleep(Duration::from_millis(jitter)).await;
                }
                Err(e) => {
                    if let Err(remove_err) = self.remove(&spec.name).await {
                        warn!(name = %spec.name, error = %remove_err, "Cleanup after failed start");
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn wait(&self, name: &str) -> Result<i64, ContainerError> {
        let response = self
            .client
            .post(self.url(&format!("/containers/{name}/wait")))
            .send()
            .await
            .map_err(|e| ContainerError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ContainerError::ExecutionFailed(format!("wait {status}: {text}")));
        }

        let wait: WaitResponse = response
            .json()
            .await
            .map_err(|e| ContainerError::ExecutionFailed(e.to_string()))?;
        Ok(wait.status_code)
    }

    async fn logs(&self, name: &str) -> Result<(String, String), ContainerError> {
        let response = self
            .client
            .get(self.url(&format!("/containers/{name}/logs")))
            .query(&[("stdout", "true"), ("stderr", "true")])
            .send()
            .await
            .map_err(|e| ContainerError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ContainerError::ExecutionFailed(format!("logs {status}")));
        }

        let mut demux = FrameDemuxer::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ContainerError::ExecutionFailed(e.to_string()))?;
            demux.feed(&chunk)?;
        }

        let out = demux.finish()?;
        Ok((out.stdout_lossy(), out.stderr_lossy()))
    }

    async fn stop(&self, name: &str) -> Result<(), ContainerError> {
        let response = self
            .client
            .post(self.url(&format!("/containers/{name}/stop")))
            .query(&[("t", self.config.stop_timeout_secs)])
            .send()
            .await
            .map_err(|e| ContainerError::ConnectionFailed(e.to_string()))?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_MODIFIED | StatusCode::NOT_FOUND => Ok(()),
            status => Err(ContainerError::StopFailed(format!("stop {status}"))),
        }
    }

    async fn remove(&self, name: &str) -> Result<(), ContainerError> {
        let response = self
            .client
            .delete(self.url(&format!("/containers/{name}")))
            .query(&[("force", "true")])
            .send()
            .await
            .map_err(|e| ContainerError::ConnectionFailed(e.to_string()))?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            status => Err(ContainerError::StopFailed(format!("remove {status}"))),
        }
    }
}

/// Build the `/containers/create` payload.
fn create_body(spec: &ContainerSpec) -> Value {
    let mut host_config = Map::new();
    host_config.insert(
        "Binds".into(),
        Value::Array(spec.mounts.iter().map(|m| Value::String(m.to_bind())).collect()),
    );
    if let Some(Value::Object(extra)) = &spec.host_config {
        for (key, value) in extra {
            host_config.insert(key.clone(), value.clone());
        }
    }

    let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

    json!({
        "Image": spec.image,
        "Cmd": spec.command,
        "Env": env,
        "AttachStdout": true,
        "AttachStderr": true,
        "Tty": false,
        "HostConfig": host_config,
    })
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, spec), fields(runtime = "docker", name = %spec.name, image = %spec.image))]
    async fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerOutput, ContainerError> {
        let start = Instant::now();
        self.create_and_start(spec).await?;

        let collected = async {
            let exit_code = self.wait(&spec.name).await?;
            let (stdout, stderr) = self.logs(&spec.name).await?;
            Ok::<_, ContainerError>((exit_code, stdout, stderr))
        }
        .await;

        if let Err(e) = self.remove(&spec.name).await {
            warn!(name = %spec.name, error = %e, "Failed to remove finished container");
        }

        let (exit_code, stdout, stderr) = collected?;
        #[allow(clippy::cast_possible_truncation)]
        let execution_time_ms = start.elapsed().as_millis() as u64;
        debug!(exit_code, execution_time_ms, "Container finished");

        Ok(ContainerOutput {
            exit_code,
            stdout,
            stderr,
            execution_time_ms,
        })
    }

    async fn stop_and_remove(&self, name: &str) -> Result<(), ContainerError> {
        self.stop(name).await?;
        self.remove(name).await
    }

    async fn is_ready(&self) -> Result<bool, ContainerError> {
        match self.client.get(self.url("/_ping")).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

/// Builder for [`DockerRuntime`].
#[derive(Debug, Default)]
pub struct DockerRuntimeBuilder {
    config: DockerConfig,
}

impl DockerRuntimeBuilder {
    /// Set the API version prefix.
    #[must_use]
    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.config.api_version = Some(version.into());
        self
    }

    /// Set the stop grace period in seconds.
    #[must_use]
    pub fn stop_timeout_secs(mut self, secs: u64) -> Self {
        self.config.stop_timeout_secs = secs;
        self
    }

    /// Set the bound on port-clash start retries.
    #[must_use]
    pub fn max_start_retries(mut self, n: u32) -> Self {
        self.config.max_start_retries = n;
        self
    }

    /// Build the runtime.
    #[must_use]
    pub fn build(self) -> DockerRuntime {
        DockerRuntime::with_config(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Mount;

    #[test]
    fn test_builder() {
        let runtime = DockerRuntime::new("http://docker:2375/")
            .api_version("v1.43")
            .stop_timeout_secs(10)
            .max_start_retries(3)
            .build();

        assert_eq!(runtime.config.stop_timeout_secs, 10);
        assert_eq!(runtime.config.max_start_retries, 3);
        assert_eq!(
            runtime.url("/containers/create"),
            "http://docker:2375/v1.43/containers/create"
        );
    }

    #[test]
    fn test_defaults() {
        let config = DockerConfig::default();
        assert_eq!(config.base_url, "http://localhost:2375");
        assert!(config.api_version.is_none());
        assert_eq!(config.max_start_retries, 500);
    }

    #[test]
    fn test_create_body() {
        let spec = ContainerSpec {
            name: "job".into(),
            image: "stats:latest".into(),
            command: vec!["python".into(), "entry.py".into()],
            mounts: vec![
                Mount::new("/data/input/a/r1", "/input").read_only(),
                Mount::new("/data/transfer/a/r1", "/transfer"),
            ],
            env: vec![("MODE".into(), "local".into())],
            host_config: Some(json!({ "Memory": 1024 })),
        };

        let body = create_body(&spec);
        assert_eq!(body["Image"], "stats:latest");
        assert_eq!(body["Cmd"][1], "entry.py");
        assert_eq!(body["Env"][0], "MODE=local");
        assert_eq!(body["Tty"], false);
        assert_eq!(body["HostConfig"]["Binds"][0], "/data/input/a/r1:/input:ro");
        assert_eq!(body["HostConfig"]["Binds"][1], "/data/transfer/a/r1:/transfer");
        assert_eq!(body["HostConfig"]["Memory"], 1024);
    }
}
