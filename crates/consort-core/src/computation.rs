//! A step's computation instance: one container descriptor bound to a run.

use consort_container::{ContainerRuntime, ContainerSpec, Mount};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::error::PipelineError;
use crate::types::{ComputationDescriptor, Mode, RunDirectories};

/// Argument handed to the computation on its command line.
#[derive(Debug, Clone, Serialize)]
pub struct ComputationInput {
    pub input: Value,
    pub cache: Map<String, Value>,
    pub state: Value,
}

/// What a computation prints on stdout.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ComputationOutput {
    #[serde(default)]
    pub output: Value,
    /// Cache entries to merge into the controller cache
    #[serde(default)]
    pub cache: Option<Map<String, Value>>,
    #[serde(default)]
    pub success: bool,
}

/// Per-run wrapper around a [`ComputationDescriptor`].
///
/// Holds at most one container at a time: a second `start` while one is in
/// flight is refused rather than queued.
pub struct Computation {
    descriptor: ComputationDescriptor,
    mode: Mode,
    run_id: String,
    client_id: String,
    step: usize,
    directories: RunDirectories,
    runtime: Arc<dyn ContainerRuntime>,
    running: Mutex<()>,
    container: Mutex<Option<String>>,
}

impl Computation {
    /// Bind `descriptor` to a run.
    #[must_use]
    pub fn new(
        descriptor: ComputationDescriptor,
        mode: Mode,
        run_id: impl Into<String>,
        client_id: impl Into<String>,
        step: usize,
        directories: RunDirectories,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            descriptor,
            mode,
            run_id: run_id.into(),
            client_id: client_id.into(),
            step,
            directories,
            runtime,
            running: Mutex::new(()),
            container: Mutex::new(None),
        }
    }

    /// The bound descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &ComputationDescriptor {
        &self.descriptor
    }

    /// Container name for `iteration`.
    #[must_use]
    pub fn container_name(&self, iteration: u64) -> String {
        let raw = format!(
            "consort-{}-{}-{}-{}-{}",
            self.run_id, self.client_id, self.mode, self.step, iteration
        );
        raw.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    }

    fn container_spec(
        &self,
        name: String,
        input: &ComputationInput,
    ) -> Result<ContainerSpec, PipelineError> {
        let mut command = self.descriptor.command_for(self.mode).to_vec();
        command.push(serde_json::to_string(input).map_err(input_not_encoded)?);

        Ok(ContainerSpec {
            name,
            image: self.descriptor.image_for(self.mode).to_string(),
            command,
            mounts: vec![
                Mount::new(path_str(&self.directories.base), "/input"),
                Mount::new(path_str(&self.directories.output), "/output"),
                Mount::new(path_str(&self.directories.cache), "/cache"),
                Mount::new(path_str(&self.directories.transfer), "/transfer"),
            ],
            env: Vec::new(),
            host_config: self.descriptor.host_config.clone(),
        })
    }

    /// Run one iteration in a fresh container.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ComputationExecution`] if another iteration is
    /// still running, the runtime fails, the container exits non-zero or
    /// writes to stderr, or stdout is not a valid output document.
    #[instrument(skip(self, input), fields(run_id = %self.run_id, step = self.step))]
    pub async fn start(
        &self,
        iteration: u64,
        input: ComputationInput,
    ) -> Result<ComputationOutput, PipelineError> {
        let _running = self.running.try_lock().map_err(|_| {
            PipelineError::ComputationExecution(format!(
                "computation for step {} is already running",
                self.step
            ))
        })?;

        let name = self.container_name(iteration);
        let spec = self.container_spec(name.clone(), &input)?;
        *self.container.lock().await = Some(name);

        debug!(image = %spec.image, iteration, "Starting computation");
        let result = self.runtime.run_container(&spec).await;
        *self.container.lock().await = None;
        let out = result?;

        if !out.stderr.trim().is_empty() {
            return Err(PipelineError::ComputationExecution(out.stderr));
        }
        if out.exit_code != 0 {
            return Err(PipelineError::ComputationExecution(format!(
                "computation exited with status {}",
                out.exit_code
            )));
        }

        debug!(
            iteration,
            execution_time_ms = out.execution_time_ms,
            "Computation finished"
        );
        serde_json::from_str(out.stdout.trim()).map_err(|e| {
            PipelineError::ComputationExecution(format!("invalid computation output: {e}"))
        })
    }

    /// Stop and remove the container left behind by an interrupted iteration.
    pub async fn stop(&self) {
        let Some(name) = self.container.lock().await.take() else {
            return;
        };
        if let Err(e) = self.runtime.stop_and_remove(&name).await {
            warn!(container = %name, error = %e, "Failed to stop computation container");
        }
    }
}

fn path_str(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

fn input_not_encoded(err: serde_json::Error) -> PipelineError {
    PipelineError::ComputationExecution(format!("could not encode computation input: {err}"))
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedRuntime;
    use super::*;
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn descriptor() -> ComputationDescriptor {
        serde_json::from_value(json!({
            "dockerImage": "stats-local:1",
            "command": ["python", "local.py"],
            "remote": { "dockerImage": "stats-remote:1", "command": ["python", "remote.py"] }
        }))
        .unwrap()
    }

    fn computation(mode: Mode, runtime: Arc<ScriptedRuntime>) -> Computation {
        let dirs = RunDirectories::new(Path::new("/work"), "site a", "run-1");
        Computation::new(descriptor(), mode, "run-1", "site a", 0, dirs, runtime)
    }

    fn input() -> ComputationInput {
        ComputationInput {
            input: json!({"x": 1}),
            cache: Map::new(),
            state: json!({"iteration": 1}),
        }
    }

    #[tokio::test]
    async fn test_container_spec_for_mode() {
        let runtime = Arc::new(ScriptedRuntime::with_outputs(vec![
            json!({"output": {"y": 2}, "success": true}),
        ]));
        let comp = computation(Mode::Remote, runtime.clone());

        let out = comp.start(1, input()).await.unwrap();
        assert_eq!(out.output, json!({"y": 2}));
        assert!(out.success);

        let spec = runtime.specs.lock().unwrap()[0].clone();
        assert_eq!(spec.image, "stats-remote:1");
        assert_eq!(spec.name, "consort-run-1-site-a-remote-0-1");
        assert_eq!(&spec.command[..2], ["python", "remote.py"]);
        let arg: Value = serde_json::from_str(&spec.command[2]).unwrap();
        assert_eq!(arg["input"], json!({"x": 1}));
        assert_eq!(spec.host_path_for("/transfer"), Some("/work/transfer/site a/run-1"));
    }

    #[tokio::test]
    async fn test_stderr_is_an_error() {
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime.push_stderr("Traceback: division by zero");
        let comp = computation(Mode::Local, runtime);

        let err = comp.start(1, input()).await.unwrap_err();
        assert!(matches!(err, PipelineError::ComputationExecution(m) if m.contains("division")));
    }

    #[tokio::test]
    async fn test_invalid_stdout_is_an_error() {
        let runtime = Arc::new(ScriptedRuntime::default());
        runtime
            .outputs
            .lock()
            .unwrap()
            .push_back(Ok("not json".to_string()));
        let comp = computation(Mode::Local, runtime);

        assert!(matches!(
            comp.start(1, input()).await,
            Err(PipelineError::ComputationExecution(m)) if m.starts_with("invalid computation output")
        ));
    }

    #[test]
    fn test_input_encoding_error_names_the_input() {
        let err = serde_json::from_str::<Value>("{").unwrap_err();

        let mapped = input_not_encoded(err);
        assert!(matches!(
            mapped,
            PipelineError::ComputationExecution(m)
                if m.starts_with("could not encode computation input") && !m.contains("output")
        ));
    }

    #[tokio::test]
    async fn test_second_concurrent_start_is_refused() {
        let runtime = Arc::new(ScriptedRuntime {
            delay: Some(Duration::from_millis(50)),
            ..ScriptedRuntime::with_outputs(vec![json!({"output": 1}), json!({"output": 2})])
        });
        let comp = computation(Mode::Local, runtime.clone());

        let (first, second) = tokio::join!(comp.start(1, input()), comp.start(2, input()));
        assert!(first.is_ok());
        assert!(matches!(second, Err(PipelineError::ComputationExecution(_))));
        assert_eq!(runtime.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_removes_interrupted_container() {
        let runtime = Arc::new(ScriptedRuntime {
            delay: Some(Duration::from_secs(60)),
            ..ScriptedRuntime::default()
        });
        let comp = computation(Mode::Local, runtime.clone());

        let interrupted =
            tokio::time::timeout(Duration::from_millis(20), comp.start(3, input())).await;
        assert!(interrupted.is_err());
        comp.stop().await;

        assert_eq!(
            runtime.removed.lock().unwrap().as_slice(),
            ["consort-run-1-site-a-local-0-3"]
        );
    }
}
