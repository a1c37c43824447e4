//! Pipeline error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Serializable error carried in control messages.
///
/// Errors cross node boundaries as `{message, stack}`; the message is
/// prefixed with the node it came from so peers can tell a central node
/// failure from a client failure.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct RunError {
    /// Human readable message
    pub message: String,
    /// Origin trace, when the sender had one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RunError {
    /// Create a new run error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    /// Error raised by the central node.
    #[must_use]
    pub fn from_central_node(details: &str) -> Self {
        Self::new(format!(
            "Pipeline error from central node\n Error details: {details}"
        ))
    }

    /// Error reported by a participating client.
    #[must_use]
    pub fn from_client(run_id: &str, client_id: &str, details: &str) -> Self {
        Self::new(format!(
            "Pipeline error from pipeline {run_id} user: {client_id}\n Error details: {details}"
        ))
    }

    /// Attach a stack/trace string.
    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl From<&PipelineError> for RunError {
    fn from(err: &PipelineError) -> Self {
        match err {
            PipelineError::Peer(run_error) => run_error.clone(),
            other => Self::new(other.to_string()).with_stack(format!("{other:?}")),
        }
    }
}

/// Errors that can occur while running a pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A non-terminal run with this id already exists
    #[error("Duplicate pipeline started: {0}")]
    DuplicatePipeline(String),

    /// No run with this id
    #[error("Invalid pipeline ID: {0}")]
    InvalidPipelineId(String),

    /// The container adapter failed or the computation reported an error
    #[error("Computation execution failed: {0}")]
    ComputationExecution(String),

    /// Control channel or peer exchange failed
    #[error("Remote communication failed: {0}")]
    RemoteCommunication(String),

    /// A step input is not mapped yet
    #[error("Input mapping incomplete: {0}")]
    MappingIncomplete(String),

    /// File transfer gave up after its retry budget
    #[error("Service down, file retry limit reached: {0}")]
    TransferRetryExhausted(String),

    /// Error raised by, or annotated for, another node
    #[error("{0}")]
    Peer(RunError),

    /// The pipeline was stopped
    #[error("Pipeline stopped")]
    Stopped,

    /// Pipeline specification is unusable
    #[error("Invalid pipeline specification: {0}")]
    InvalidSpec(String),

    /// The control box issued a command the controller does not implement
    #[error("Unsupported controller command: {0}")]
    UnsupportedCommand(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<consort_container::ContainerError> for PipelineError {
    fn from(err: consort_container::ContainerError) -> Self {
        Self::ComputationExecution(err.to_string())
    }
}
