//! Hook through which a step exchanges results with the other nodes of a run.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::PipelineError;

/// What the controller expects from a remote exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    /// Send the current output and wait for the aggregated answer
    Exchange,
    /// Send nothing; wait for the first answer (remote node bootstrap)
    Kickoff,
    /// Send the final output; do not wait
    TransmitOnly,
}

/// Request issued by a step controller.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    /// Index of the issuing step
    pub step: usize,
    /// Controller iteration the output belongs to
    pub iteration: u64,
    /// Request kind
    pub kind: RemoteKind,
    /// Current output of the step (`Null` before the first computation)
    pub output: Value,
    /// Whether the last computation reported success
    pub success: bool,
}

/// Answer to a [`RemoteRequest`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteResponse {
    /// Output received from the peers
    pub output: Value,
    /// Whether the peers report the step as complete
    pub success: bool,
}

impl RemoteResponse {
    /// Build a response.
    #[must_use]
    pub fn new(output: Value, success: bool) -> Self {
        Self { output, success }
    }
}

/// Remote communication hook supplied by whoever runs the pipeline.
///
/// Cancelling a step drops the pending `exchange` future; implementations
/// must tolerate that.
#[async_trait]
pub trait RemoteHandler: Send + Sync {
    /// Perform one exchange.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport fails or a peer reports an error.
    async fn exchange(&self, request: RemoteRequest) -> Result<RemoteResponse, PipelineError>;
}

/// Handler for runs without peers; any exchange is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRemote;

#[async_trait]
impl RemoteHandler for NoRemote {
    async fn exchange(&self, request: RemoteRequest) -> Result<RemoteResponse, PipelineError> {
        Err(PipelineError::RemoteCommunication(format!(
            "step {} requested a remote exchange but the run has no peers",
            request.step
        )))
    }
}
