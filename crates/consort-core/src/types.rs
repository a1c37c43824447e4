//! Core type definitions: run modes, pipeline specifications, directories.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

/// Which side of a decentralized run this node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// A client node; computes on its own data
    #[default]
    Local,
    /// The aggregator node
    Remote,
}

impl Mode {
    /// Wire name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Controller type tag of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerType {
    /// Iterate locally until the computation reports success
    Local,
    /// Iterate in lockstep with the other nodes of the run
    Decentralized,
}

/// Controller descriptor of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerDescriptor {
    /// Controller type
    #[serde(rename = "type")]
    pub kind: ControllerType,
    /// Free-form options handed to the control box
    #[serde(default)]
    pub options: Value,
}

impl ControllerDescriptor {
    /// Descriptor with empty options.
    #[must_use]
    pub fn new(kind: ControllerType) -> Self {
        Self {
            kind,
            options: Value::Null,
        }
    }
}

/// The aggregator side of a computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteComputation {
    /// Image run on the remote node
    pub docker_image: String,
    /// Command run on the remote node
    pub command: Vec<String>,
}

/// A computation container descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputationDescriptor {
    /// Computation id
    #[serde(default)]
    pub id: Option<String>,
    /// Image run on local nodes
    pub docker_image: String,
    /// Command run on local nodes
    pub command: Vec<String>,
    /// Remote-side image and command, for decentralized computations
    #[serde(default)]
    pub remote: Option<RemoteComputation>,
    /// Extra engine host configuration
    #[serde(default)]
    pub host_config: Option<Value>,
}

impl ComputationDescriptor {
    /// Image to run in `mode`.
    #[must_use]
    pub fn image_for(&self, mode: Mode) -> &str {
        match (mode, &self.remote) {
            (Mode::Remote, Some(remote)) => &remote.docker_image,
            _ => &self.docker_image,
        }
    }

    /// Command to run in `mode`.
    #[must_use]
    pub fn command_for(&self, mode: Mode) -> &[String] {
        match (mode, &self.remote) {
            (Mode::Remote, Some(remote)) => &remote.command,
            _ => &self.command,
        }
    }
}

/// Reference to a variable produced by an earlier step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRef {
    /// Index of the producing step
    pub step: usize,
    /// Variable name in that step's output
    pub variable: String,
    /// Display label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// One entry of a step's input map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSource {
    /// Value taken from an earlier step's output
    FromCache {
        #[serde(rename = "fromCache")]
        from_cache: CacheRef,
    },
    /// Static value
    Value {
        #[serde(default)]
        value: Value,
        #[serde(default = "fulfilled_default")]
        fulfilled: bool,
    },
}

fn fulfilled_default() -> bool {
    true
}

impl InputSource {
    /// Static, fulfilled value.
    #[must_use]
    pub fn value(value: Value) -> Self {
        Self::Value {
            value,
            fulfilled: true,
        }
    }

    /// Reference to `variable` of step `step`.
    #[must_use]
    pub fn from_cache(step: usize, variable: impl Into<String>) -> Self {
        Self::FromCache {
            from_cache: CacheRef {
                step,
                variable: variable.into(),
                label: None,
            },
        }
    }
}

/// An ordered pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    /// Controller descriptor
    pub controller: ControllerDescriptor,
    /// Computations run by this step
    pub computations: Vec<ComputationDescriptor>,
    /// Input map
    #[serde(default)]
    pub input_map: BTreeMap<String, InputSource>,
}

/// A pipeline specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    /// Pipeline id
    #[serde(default)]
    pub id: Option<String>,
    /// Steps, executed in order
    pub steps: Vec<StepSpec>,
    /// Consortium owner client id
    #[serde(default)]
    pub owner: Option<String>,
    /// Only the owner receives result files
    #[serde(default)]
    pub limit_output_to_owner: bool,
}

impl PipelineSpec {
    /// Check the structural constraints the engine relies on.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidSpec`] for a pipeline without steps,
    /// a step without exactly one computation, or an empty command.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.steps.is_empty() {
            return Err(PipelineError::InvalidSpec("pipeline has no steps".into()));
        }

        for (index, step) in self.steps.iter().enumerate() {
            match step.computations.as_slice() {
                [computation] => {
                    if computation.command.is_empty() {
                        return Err(PipelineError::InvalidSpec(format!(
                            "step {index} has an empty command"
                        )));
                    }
                }
                [] => {
                    return Err(PipelineError::InvalidSpec(format!(
                        "step {index} has no computation"
                    )))
                }
                _ => {
                    return Err(PipelineError::InvalidSpec(format!(
                        "step {index} declares {} computations, only one per step is supported",
                        step.computations.len()
                    )))
                }
            }

            for (key, source) in &step.input_map {
                if let InputSource::FromCache { from_cache } = source {
                    if from_cache.step >= index {
                        return Err(PipelineError::InvalidSpec(format!(
                            "step {index} input '{key}' references step {}, which does not run earlier",
                            from_cache.step
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// The working directories of one run on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDirectories {
    /// `input/<clientId>/<runId>`
    pub base: PathBuf,
    /// `output/<clientId>/<runId>`
    pub output: PathBuf,
    /// `cache/<clientId>/<runId>`
    pub cache: PathBuf,
    /// `transfer/<clientId>/<runId>`
    pub transfer: PathBuf,
    /// `system/<clientId>/<runId>`
    pub system: PathBuf,
}

impl RunDirectories {
    /// Lay out the directories of `run_id` under `operating_directory`.
    #[must_use]
    pub fn new(operating_directory: &Path, client_id: &str, run_id: &str) -> Self {
        let dir = |kind: &str| operating_directory.join(kind).join(client_id).join(run_id);
        Self {
            base: dir("input"),
            output: dir("output"),
            cache: dir("cache"),
            transfer: dir("transfer"),
            system: dir("system"),
        }
    }

    /// All five directories.
    #[must_use]
    pub fn all(&self) -> [&Path; 5] {
        [
            &self.base,
            &self.output,
            &self.cache,
            &self.transfer,
            &self.system,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn computation() -> serde_json::Value {
        json!({ "dockerImage": "stats:1", "command": ["python", "local.py"] })
    }

    #[test]
    fn test_spec_from_json() {
        let spec: PipelineSpec = serde_json::from_value(json!({
            "owner": "site-a",
            "limitOutputToOwner": true,
            "steps": [{
                "controller": { "type": "decentralized" },
                "computations": [{
                    "dockerImage": "stats:1",
                    "command": ["python", "local.py"],
                    "remote": { "dockerImage": "stats:1", "command": ["python", "remote.py"] }
                }],
                "inputMap": {
                    "lambda": { "value": 0.5 },
                    "covariates": { "fromCache": { "step": 0, "variable": "covariates" } },
                    "pending": { "fulfilled": false }
                }
            }]
        }))
        .unwrap();

        assert!(spec.limit_output_to_owner);
        let step = &spec.steps[0];
        assert_eq!(step.controller.kind, ControllerType::Decentralized);
        assert_eq!(step.computations[0].command_for(Mode::Remote)[1], "remote.py");
        assert_eq!(step.computations[0].command_for(Mode::Local)[1], "local.py");
        assert_eq!(step.input_map["lambda"], InputSource::value(json!(0.5)));
        assert_eq!(step.input_map["covariates"], InputSource::from_cache(0, "covariates"));
        assert_eq!(
            step.input_map["pending"],
            InputSource::Value {
                value: Value::Null,
                fulfilled: false
            }
        );
    }

    #[test]
    fn test_validate_rejects_multi_computation_steps() {
        let spec: PipelineSpec = serde_json::from_value(json!({
            "steps": [{
                "controller": { "type": "local" },
                "computations": [computation(), computation()]
            }]
        }))
        .unwrap();

        assert!(matches!(spec.validate(), Err(PipelineError::InvalidSpec(_))));
    }

    #[test]
    fn test_validate_rejects_forward_references() {
        let spec: PipelineSpec = serde_json::from_value(json!({
            "steps": [{
                "controller": { "type": "local" },
                "computations": [computation()],
                "inputMap": { "x": { "fromCache": { "step": 0, "variable": "x" } } }
            }]
        }))
        .unwrap();

        assert!(matches!(spec.validate(), Err(PipelineError::InvalidSpec(_))));
    }

    #[test]
    fn test_run_directories_layout() {
        let dirs = RunDirectories::new(Path::new("/srv/consort"), "site-a", "run-1");

        assert_eq!(dirs.base, Path::new("/srv/consort/input/site-a/run-1"));
        assert_eq!(dirs.transfer, Path::new("/srv/consort/transfer/site-a/run-1"));
        assert_eq!(dirs.all().len(), 5);
    }
}
