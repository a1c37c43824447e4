//! Control boxes: per-controller-type iteration policies.
//!
//! A box looks at the controller state before every iteration and answers
//! with the next [`PhaseCommand`]. `current_command` holds the command that
//! ran last (`None` on the first pass).

use super::{ControllerState, PhaseCommand};
use crate::types::{ControllerType, Mode};

/// Iteration policy of a controller type.
pub trait ControlBox: Send + Sync {
    /// Pick the next phase command.
    fn pre_iteration(&self, state: &ControllerState) -> PhaseCommand;
}

impl ControllerType {
    /// The control box implementing this controller type.
    #[must_use]
    pub fn control_box(&self) -> Box<dyn ControlBox> {
        match self {
            Self::Local => Box::new(LocalBox),
            Self::Decentralized => Box::new(DecentralizedBox),
        }
    }
}

/// Iterates a computation on this node alone until it reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBox;

impl ControlBox for LocalBox {
    fn pre_iteration(&self, state: &ControllerState) -> PhaseCommand {
        match state.current_command {
            Some(PhaseCommand::NextIteration) if state.last_success() => PhaseCommand::Done,
            _ => PhaseCommand::NextIteration,
        }
    }
}

/// Alternates computation and remote exchange across the nodes of a run.
///
/// Local nodes compute first and hand their output to the remote; the remote
/// kicks off by waiting for that output, aggregates, and sends the result
/// back until its own computation reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecentralizedBox;

impl ControlBox for DecentralizedBox {
    fn pre_iteration(&self, state: &ControllerState) -> PhaseCommand {
        match state.mode {
            Mode::Remote => match state.current_command {
                None => PhaseCommand::FirstServerRemote,
                Some(PhaseCommand::FirstServerRemote | PhaseCommand::Remote) => {
                    PhaseCommand::NextIteration
                }
                Some(PhaseCommand::NextIteration) if state.last_success() => {
                    PhaseCommand::DoneRemote
                }
                Some(PhaseCommand::NextIteration) => PhaseCommand::Remote,
                Some(
                    PhaseCommand::DoneRemote
                    | PhaseCommand::Done
                    | PhaseCommand::NextComputation,
                ) => PhaseCommand::Done,
            },
            Mode::Local => match state.current_command {
                None => PhaseCommand::NextIteration,
                Some(PhaseCommand::NextIteration) => PhaseCommand::Remote,
                Some(PhaseCommand::Remote | PhaseCommand::FirstServerRemote)
                    if state.last_success() =>
                {
                    PhaseCommand::Done
                }
                Some(PhaseCommand::Remote | PhaseCommand::FirstServerRemote) => {
                    PhaseCommand::NextIteration
                }
                Some(
                    PhaseCommand::DoneRemote
                    | PhaseCommand::Done
                    | PhaseCommand::NextComputation,
                ) => PhaseCommand::Done,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::StepOutput;
    use serde_json::Value;

    fn state(mode: Mode, command: Option<PhaseCommand>, success: bool) -> ControllerState {
        ControllerState {
            mode,
            current_command: command,
            current_output: Some(StepOutput {
                output: Value::Null,
                success,
            }),
            ..ControllerState::new(mode)
        }
    }

    #[test]
    fn test_local_box_iterates_until_success() {
        let local = ControllerType::Local.control_box();

        assert_eq!(
            local.pre_iteration(&ControllerState::new(Mode::Local)),
            PhaseCommand::NextIteration
        );
        assert_eq!(
            local.pre_iteration(&state(Mode::Local, Some(PhaseCommand::NextIteration), false)),
            PhaseCommand::NextIteration
        );
        assert_eq!(
            local.pre_iteration(&state(Mode::Local, Some(PhaseCommand::NextIteration), true)),
            PhaseCommand::Done
        );
    }

    #[test]
    fn test_decentralized_remote_node() {
        let dec = DecentralizedBox;
        let remote = |cmd, ok| dec.pre_iteration(&state(Mode::Remote, cmd, ok));

        assert_eq!(
            dec.pre_iteration(&ControllerState::new(Mode::Remote)),
            PhaseCommand::FirstServerRemote
        );
        assert_eq!(
            remote(Some(PhaseCommand::FirstServerRemote), false),
            PhaseCommand::NextIteration
        );
        assert_eq!(remote(Some(PhaseCommand::NextIteration), false), PhaseCommand::Remote);
        assert_eq!(remote(Some(PhaseCommand::Remote), false), PhaseCommand::NextIteration);
        assert_eq!(remote(Some(PhaseCommand::NextIteration), true), PhaseCommand::DoneRemote);
        assert_eq!(remote(Some(PhaseCommand::DoneRemote), true), PhaseCommand::Done);
    }

    #[test]
    fn test_decentralized_local_node() {
        let dec = DecentralizedBox;
        let local = |cmd, ok| dec.pre_iteration(&state(Mode::Local, cmd, ok));

        assert_eq!(
            dec.pre_iteration(&ControllerState::new(Mode::Local)),
            PhaseCommand::NextIteration
        );
        assert_eq!(local(Some(PhaseCommand::NextIteration), true), PhaseCommand::Remote);
        assert_eq!(local(Some(PhaseCommand::Remote), false), PhaseCommand::NextIteration);
        assert_eq!(local(Some(PhaseCommand::Remote), true), PhaseCommand::Done);
    }
}
