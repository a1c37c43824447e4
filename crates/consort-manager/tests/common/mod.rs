#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use consort_bus::{MemoryBus, MessageBus, MessageStream};
use consort_container::{ContainerError, ContainerOutput, ContainerRuntime, ContainerSpec};
use consort_core::{ControlMessage, Mode, PipelineSpec};
use consort_manager::{ManagerConfig, PipelineManager, TransferConfig, TransferEndpoint};

/// What a scripted computation sees.
#[derive(Debug, Clone)]
pub struct Call {
    pub input: Value,
    pub step: u64,
    pub iteration: u64,
    pub input_dir: PathBuf,
    pub transfer_dir: PathBuf,
}

/// What a scripted computation answers.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub output: Value,
    pub success: bool,
    /// Files written to `/transfer` before returning
    pub files: Vec<(String, Vec<u8>)>,
}

impl Reply {
    pub fn new(output: Value, success: bool) -> Self {
        Self {
            output,
            success,
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, name: &str, contents: &[u8]) -> Self {
        self.files.push((name.to_string(), contents.to_vec()));
        self
    }
}

type Script = dyn Fn(&Call) -> Result<Reply, String> + Send + Sync;

/// Container runtime that answers from a closure instead of a container.
pub struct ScriptRuntime {
    script: Box<Script>,
    first_call_delay: Mutex<Option<Duration>>,
    pub calls: Mutex<Vec<Call>>,
}

impl ScriptRuntime {
    pub fn new(script: impl Fn(&Call) -> Result<Reply, String> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            first_call_delay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Always succeed with `output`.
    pub fn constant(output: Value) -> Self {
        Self::new(move |_| Ok(Reply::new(output.clone(), true)))
    }

    pub fn with_first_call_delay(self, delay: Duration) -> Self {
        *self.first_call_delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ContainerRuntime for ScriptRuntime {
    async fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerOutput, ContainerError> {
        let arg: Value = serde_json::from_str(spec.command.last().map_or("{}", String::as_str))
            .map_err(|e| ContainerError::CreateFailed(e.to_string()))?;
        let call = Call {
            input: arg["input"].clone(),
            step: arg["state"]["step"].as_u64().unwrap_or_default(),
            iteration: arg["state"]["iteration"].as_u64().unwrap_or_default(),
            input_dir: PathBuf::from(spec.host_path_for("/input").unwrap_or_default()),
            transfer_dir: PathBuf::from(spec.host_path_for("/transfer").unwrap_or_default()),
        };

        let delay = self.first_call_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (stdout, stderr) = match (self.script)(&call) {
            Ok(reply) => {
                for (name, contents) in &reply.files {
                    std::fs::write(call.transfer_dir.join(name), contents)
                        .map_err(|e| ContainerError::StartFailed(e.to_string()))?;
                }
                let stdout = json!({ "output": reply.output, "success": reply.success });
                (stdout.to_string(), String::new())
            }
            Err(message) => (String::new(), message),
        };
        self.calls.lock().unwrap().push(call);

        Ok(ContainerOutput {
            exit_code: 0,
            stdout,
            stderr,
            execution_time_ms: 1,
        })
    }

    async fn stop_and_remove(&self, _name: &str) -> Result<(), ContainerError> {
        Ok(())
    }

    async fn is_ready(&self) -> Result<bool, ContainerError> {
        Ok(true)
    }
}

pub fn local_spec() -> PipelineSpec {
    serde_json::from_value(json!({
        "id": "local-pipeline",
        "steps": [{
            "controller": { "type": "local" },
            "computations": [{ "dockerImage": "stats:1", "command": ["python", "local.py"] }],
            "inputMap": { "lambda": { "value": 0.5 } }
        }]
    }))
    .unwrap()
}

pub fn decentralized_spec(owner: &str, limit_output_to_owner: bool) -> PipelineSpec {
    serde_json::from_value(json!({
        "id": "decentralized-pipeline",
        "owner": owner,
        "limitOutputToOwner": limit_output_to_owner,
        "steps": [{
            "controller": { "type": "decentralized" },
            "computations": [{
                "dockerImage": "stats:1",
                "command": ["python", "local.py"],
                "remote": { "dockerImage": "stats:1", "command": ["python", "remote.py"] }
            }]
        }]
    }))
    .unwrap()
}

/// Two decentralized steps; the second reads the first one's `total`.
pub fn two_step_decentralized_spec() -> PipelineSpec {
    let step = |input_map: Value| {
        json!({
            "controller": { "type": "decentralized" },
            "computations": [{
                "dockerImage": "stats:1",
                "command": ["python", "local.py"],
                "remote": { "dockerImage": "stats:1", "command": ["python", "remote.py"] }
            }],
            "inputMap": input_map
        })
    };
    serde_json::from_value(json!({
        "id": "two-step-pipeline",
        "owner": "site-a",
        "steps": [
            step(json!({})),
            step(json!({ "prior": { "fromCache": { "step": 0, "variable": "total" } } })),
        ]
    }))
    .unwrap()
}

fn fast_transfer() -> TransferConfig {
    TransferConfig {
        retry_base_delay_ms: 10,
        upload_retry_limit: 3,
        download_retry_limit: 3,
        ..TransferConfig::default()
    }
}

pub async fn remote_manager(
    bus: &MemoryBus,
    dir: &Path,
    runtime: Arc<ScriptRuntime>,
) -> PipelineManager {
    let config = ManagerConfig::new("central", Mode::Remote)
        .with_operating_directory(dir)
        .with_listen_addr(([127, 0, 0, 1], 0).into())
        .with_transfer(fast_transfer());
    PipelineManager::builder(config, Arc::new(bus.clone()), runtime)
        .build()
        .await
        .unwrap()
}

pub async fn local_manager(
    bus: &MemoryBus,
    dir: &Path,
    client_id: &str,
    runtime: Arc<ScriptRuntime>,
    remote_port: u16,
) -> PipelineManager {
    let endpoint = TransferEndpoint {
        host: "127.0.0.1".into(),
        port: remote_port,
        ..TransferEndpoint::default()
    };
    let config = ManagerConfig::new(client_id, Mode::Local)
        .with_operating_directory(dir)
        .with_remote(endpoint)
        .with_transfer(fast_transfer())
        .with_preserve_output(true);
    PipelineManager::builder(config, Arc::new(bus.clone()), runtime)
        .build()
        .await
        .unwrap()
}

pub async fn subscribe(bus: &MemoryBus, topic: &str) -> MessageStream {
    bus.channel(topic).subscribe().await.unwrap()
}

/// Next message on `stream`, failing the test after five seconds.
pub async fn next_message(stream: &mut MessageStream) -> ControlMessage {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for a message")
        .expect("stream closed")
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}
