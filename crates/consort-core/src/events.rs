//! State updates published while a run progresses.

use serde::{Deserialize, Serialize};

use crate::controller::{PhaseCommand, StepState};

/// One state change of a run, tagged with the step it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    pub run_id: String,
    pub step: usize,
    pub iteration: u64,
    pub state: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<PhaseCommand>,
    /// Clients the remote node is still waiting on
    #[serde(default)]
    pub waiting_on: Vec<String>,
}

/// Latest status of a run, kept in a watch channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PipelineStatus {
    /// Index of the step currently executing
    pub current_step: usize,
    /// Controller iteration of that step
    pub current_iteration: u64,
    pub step_state: StepState,
    pub command: Option<PhaseCommand>,
}
