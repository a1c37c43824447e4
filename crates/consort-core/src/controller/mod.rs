//! Step controller: drives one step's computation through its iterations.
//!
//! The controller asks its [`ControlBox`] for a [`PhaseCommand`] before every
//! iteration and executes it: run the computation, exchange with the other
//! nodes, or finish. Iterations run in a plain loop that yields to the
//! scheduler in between, so a run may iterate any number of times.

mod control_box;

pub use control_box::{ControlBox, DecentralizedBox, LocalBox};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::computation::{Computation, ComputationInput};
use crate::error::PipelineError;
use crate::events::{PipelineStatus, StateUpdate};
use crate::remote::{RemoteHandler, RemoteKind, RemoteRequest};
use crate::types::{ControllerType, Mode};

/// Command issued by a control box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PhaseCommand {
    /// Run the computation once more
    NextIteration,
    /// Move to the next computation of the step (not supported)
    NextComputation,
    /// Exchange the current output with the other nodes
    Remote,
    /// Wait for the first exchange without sending anything
    FirstServerRemote,
    /// Send the final output without waiting for an answer
    DoneRemote,
    /// Finish the step
    Done,
}

impl fmt::Display for PhaseCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NextIteration => "nextIteration",
            Self::NextComputation => "nextComputation",
            Self::Remote => "remote",
            Self::FirstServerRemote => "firstServerRemote",
            Self::DoneRemote => "doneRemote",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a step controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    #[default]
    Created,
    Started,
    Running,
    WaitingOnComputation,
    FinishedIteration,
    WaitingOnRemote,
    FinishedRemoteIteration,
    FinishedFinalRemoteIteration,
    Stopped,
    Error,
}

impl StepState {
    /// `stopped` or `error`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

/// Output of the last computation or exchange.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepOutput {
    pub output: Value,
    pub success: bool,
}

/// Mutable state of a step controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerState {
    /// Number of computation iterations run so far
    pub iteration: u64,
    pub state: StepState,
    /// Command executed last; `None` before the first one
    pub current_command: Option<PhaseCommand>,
    pub computation_index: usize,
    pub current_output: Option<StepOutput>,
    pub initialized: bool,
    pub mode: Mode,
}

impl ControllerState {
    /// Fresh state for a node in `mode`.
    #[must_use]
    pub fn new(mode: Mode) -> Self {
        Self {
            iteration: 0,
            state: StepState::Created,
            current_command: None,
            computation_index: 0,
            current_output: None,
            initialized: false,
            mode,
        }
    }

    /// Whether the last computation or exchange reported success.
    #[must_use]
    pub fn last_success(&self) -> bool {
        self.current_output.as_ref().is_some_and(|o| o.success)
    }
}

/// Publishes controller state changes to the run's channels.
#[derive(Clone)]
pub(crate) struct StateSink {
    pub(crate) run_id: String,
    pub(crate) step: usize,
    pub(crate) events: broadcast::Sender<StateUpdate>,
    pub(crate) status: Arc<watch::Sender<PipelineStatus>>,
}

impl StateSink {
    fn emit(&self, state: &ControllerState) {
        let update = StateUpdate {
            run_id: self.run_id.clone(),
            step: self.step,
            iteration: state.iteration,
            state: state.state,
            command: state.current_command,
            waiting_on: Vec::new(),
        };
        // No subscribers is fine.
        let _ = self.events.send(update);
        self.status.send_modify(|status| {
            status.current_step = self.step;
            status.current_iteration = state.iteration;
            status.step_state = state.state;
            status.command = state.current_command;
        });
    }
}

/// Drives one step.
pub struct StepController {
    control_box: Box<dyn ControlBox>,
    computation: Computation,
    state: ControllerState,
    cache: Map<String, Value>,
    sink: StateSink,
}

impl StepController {
    pub(crate) fn new(
        controller: ControllerType,
        computation: Computation,
        mode: Mode,
        sink: StateSink,
    ) -> Self {
        Self {
            control_box: controller.control_box(),
            computation,
            state: ControllerState::new(mode),
            cache: Map::new(),
            sink,
        }
    }

    /// Current controller state.
    #[must_use]
    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    /// Cache accumulated from the computation's outputs.
    #[must_use]
    pub fn cache(&self) -> &Map<String, Value> {
        &self.cache
    }

    /// Merge entries carried over from earlier steps into the cache.
    pub(crate) fn seed_cache(&mut self, cache: &Map<String, Value>) {
        self.cache
            .extend(cache.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    fn set_state(&mut self, state: StepState) {
        self.state.state = state;
        self.sink.emit(&self.state);
    }

    /// Run the step to completion and return its final output.
    ///
    /// The active container is stopped and removed whichever way the step
    /// ends.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by the computation or the remote hook,
    /// [`PipelineError::Stopped`] when `cancel` fires, and
    /// [`PipelineError::UnsupportedCommand`] for `nextComputation`.
    #[instrument(
        skip(self, input, remote, cancel),
        fields(run_id = %self.sink.run_id, step = self.sink.step, mode = %self.state.mode)
    )]
    pub async fn start(
        &mut self,
        input: Value,
        remote: &dyn RemoteHandler,
        cancel: &CancellationToken,
    ) -> Result<Value, PipelineError> {
        self.set_state(StepState::Started);
        if !self.state.initialized {
            self.state.initialized = true;
            self.state.computation_index = 0;
            self.state.iteration = 0;
        }
        self.set_state(StepState::Running);

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PipelineError::Stopped),
            result = self.iterate(input, remote) => result,
        };

        match result {
            Ok(output) => {
                self.set_state(StepState::Stopped);
                self.computation.stop().await;
                info!(iterations = self.state.iteration, "Step finished");
                Ok(output)
            }
            Err(e) => {
                self.set_state(StepState::Error);
                self.computation.stop().await;
                warn!(iteration = self.state.iteration, error = %e, "Step failed");
                Err(e)
            }
        }
    }

    async fn iterate(
        &mut self,
        input: Value,
        remote: &dyn RemoteHandler,
    ) -> Result<Value, PipelineError> {
        let mut current = input;

        loop {
            let command = self.control_box.pre_iteration(&self.state);
            self.state.current_command = Some(command);
            debug!(%command, iteration = self.state.iteration, "Phase command");

            match command {
                PhaseCommand::NextIteration => {
                    self.state.iteration += 1;
                    self.set_state(StepState::WaitingOnComputation);

                    let input = ComputationInput {
                        input: current,
                        cache: self.cache.clone(),
                        state: self.computation_state(),
                    };
                    let out = self.computation.start(self.state.iteration, input).await?;
                    if let Some(cache) = out.cache {
                        self.cache.extend(cache);
                    }
                    self.state.current_output = Some(StepOutput {
                        output: out.output.clone(),
                        success: out.success,
                    });
                    self.set_state(StepState::FinishedIteration);
                    current = out.output;
                }
                PhaseCommand::NextComputation => {
                    return Err(PipelineError::UnsupportedCommand(command.to_string()));
                }
                PhaseCommand::Remote | PhaseCommand::FirstServerRemote => {
                    let kind = if command == PhaseCommand::Remote {
                        RemoteKind::Exchange
                    } else {
                        RemoteKind::Kickoff
                    };
                    self.set_state(StepState::WaitingOnRemote);
                    let response = remote.exchange(self.request(kind)).await?;
                    self.state.current_output = Some(StepOutput {
                        output: response.output.clone(),
                        success: response.success,
                    });
                    self.set_state(StepState::FinishedRemoteIteration);
                    current = response.output;
                }
                PhaseCommand::DoneRemote => {
                    self.set_state(StepState::WaitingOnRemote);
                    remote.exchange(self.request(RemoteKind::TransmitOnly)).await?;
                    self.set_state(StepState::FinishedFinalRemoteIteration);
                }
                PhaseCommand::Done => return Ok(current),
            }

            tokio::task::yield_now().await;
        }
    }

    fn request(&self, kind: RemoteKind) -> RemoteRequest {
        let (output, success) = self
            .state
            .current_output
            .as_ref()
            .map_or((Value::Null, false), |o| (o.output.clone(), o.success));
        RemoteRequest {
            step: self.sink.step,
            iteration: self.state.iteration,
            kind,
            output,
            success,
        }
    }

    fn computation_state(&self) -> Value {
        json!({
            "runId": self.sink.run_id,
            "step": self.sink.step,
            "iteration": self.state.iteration,
            "mode": self.state.mode,
            "baseDirectory": "/input",
            "outputDirectory": "/output",
            "cacheDirectory": "/cache",
            "transferDirectory": "/transfer",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computation::testing::ScriptedRuntime;
    use crate::remote::{NoRemote, RemoteResponse};
    use crate::types::{ComputationDescriptor, RunDirectories};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn descriptor() -> ComputationDescriptor {
        serde_json::from_value(json!({"dockerImage": "c:1", "command": ["run"]})).unwrap()
    }

    fn controller(
        kind: ControllerType,
        mode: Mode,
        runtime: Arc<ScriptedRuntime>,
    ) -> (StepController, broadcast::Receiver<StateUpdate>) {
        let dirs = RunDirectories::new(Path::new("/work"), "site-a", "run-1");
        let computation = Computation::new(descriptor(), mode, "run-1", "site-a", 0, dirs, runtime);
        let (events, rx) = broadcast::channel(4096);
        let (status, _) = watch::channel(PipelineStatus::default());
        let sink = StateSink {
            run_id: "run-1".into(),
            step: 0,
            events,
            status: Arc::new(status),
        };
        (StepController::new(kind, computation, mode, sink), rx)
    }

    /// Aggregator stand-in: answers every exchange with the sum of the
    /// iteration counters seen, reporting success from `done_after` on.
    struct Echo {
        exchanges: AtomicU64,
        done_after: u64,
    }

    #[async_trait]
    impl RemoteHandler for Echo {
        async fn exchange(&self, request: RemoteRequest) -> Result<RemoteResponse, PipelineError> {
            let n = self.exchanges.fetch_add(1, Ordering::SeqCst) + 1;
            if request.kind == RemoteKind::TransmitOnly {
                return Ok(RemoteResponse::default());
            }
            Ok(RemoteResponse::new(json!({"round": n}), n >= self.done_after))
        }
    }

    #[tokio::test]
    async fn test_local_step_iterates_until_success() {
        let runtime = Arc::new(ScriptedRuntime::with_outputs(vec![
            json!({"output": {"v": 1}, "cache": {"seen": 1}}),
            json!({"output": {"v": 2}, "cache": {"seen": 2, "extra": true}}),
            json!({"output": {"v": 3}, "success": true}),
        ]));
        let (mut step, mut rx) = controller(ControllerType::Local, Mode::Local, runtime.clone());

        let out = step
            .start(json!({"start": true}), &NoRemote, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out, json!({"v": 3}));
        assert_eq!(step.state().iteration, 3);
        assert_eq!(step.state().state, StepState::Stopped);
        assert_eq!(step.cache()["seen"], json!(2));
        assert_eq!(runtime.calls(), 3);

        // Each computation sees the previous output as input.
        let specs = runtime.specs.lock().unwrap();
        let arg: Value = serde_json::from_str(specs[1].command.last().unwrap()).unwrap();
        assert_eq!(arg["input"], json!({"v": 1}));
        assert_eq!(arg["cache"]["seen"], json!(1));
        drop(specs);

        let mut states = Vec::new();
        while let Ok(update) = rx.try_recv() {
            states.push(update.state);
        }
        assert_eq!(states.first(), Some(&StepState::Started));
        assert_eq!(states.last(), Some(&StepState::Stopped));
    }

    #[tokio::test]
    async fn test_error_stops_computation() {
        let runtime = Arc::new(ScriptedRuntime::with_outputs(vec![json!({"output": 1})]));
        runtime.push_stderr("segfault");
        let (mut step, _rx) = controller(ControllerType::Local, Mode::Local, runtime);

        let err = step
            .start(Value::Null, &NoRemote, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::ComputationExecution(m) if m == "segfault"));
        assert_eq!(step.state().state, StepState::Error);
    }

    #[tokio::test]
    async fn test_decentralized_local_node() {
        let runtime = Arc::new(ScriptedRuntime::with_outputs(vec![
            json!({"output": {"local": 1}}),
            json!({"output": {"local": 2}}),
        ]));
        let remote = Echo {
            exchanges: AtomicU64::new(0),
            done_after: 2,
        };
        let (mut step, _rx) = controller(ControllerType::Decentralized, Mode::Local, runtime);

        let out = step
            .start(Value::Null, &remote, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out, json!({"round": 2}));
        assert_eq!(step.state().iteration, 2);
    }

    #[tokio::test]
    async fn test_decentralized_remote_node_ends_with_transmission() {
        let runtime = Arc::new(ScriptedRuntime::with_outputs(vec![
            json!({"output": {"agg": 1}}),
            json!({"output": {"agg": 2}, "success": true}),
        ]));
        let remote = Echo {
            exchanges: AtomicU64::new(0),
            done_after: u64::MAX,
        };
        let (mut step, _rx) = controller(ControllerType::Decentralized, Mode::Remote, runtime);

        let out = step
            .start(Value::Null, &remote, &CancellationToken::new())
            .await
            .unwrap();

        // kickoff, one exchange, final transmission
        assert_eq!(remote.exchanges.load(Ordering::SeqCst), 3);
        assert_eq!(out, json!({"agg": 2}));
        assert_eq!(step.state().current_command, Some(PhaseCommand::Done));
    }

    #[tokio::test]
    async fn test_many_iterations_do_not_grow_the_stack() {
        let mut outputs: Vec<Value> = (0..499).map(|i| json!({"output": i})).collect();
        outputs.push(json!({"output": "last", "success": true}));
        let runtime = Arc::new(ScriptedRuntime::with_outputs(outputs));
        let remote = Echo {
            exchanges: AtomicU64::new(0),
            done_after: u64::MAX,
        };
        let (mut step, _rx) = controller(ControllerType::Decentralized, Mode::Remote, runtime);

        let out = step
            .start(Value::Null, &remote, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out, json!("last"));
        assert_eq!(step.state().iteration, 500);
    }

    #[tokio::test]
    async fn test_cancel_stops_running_container() {
        let runtime = Arc::new(ScriptedRuntime {
            delay: Some(Duration::from_secs(60)),
            ..ScriptedRuntime::default()
        });
        let (mut step, _rx) = controller(ControllerType::Local, Mode::Local, runtime.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = step.start(Value::Null, &NoRemote, &cancel).await.unwrap_err();

        assert!(matches!(err, PipelineError::Stopped));
        assert_eq!(runtime.removed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_next_computation_is_unsupported() {
        struct Multi;
        impl ControlBox for Multi {
            fn pre_iteration(&self, _: &ControllerState) -> PhaseCommand {
                PhaseCommand::NextComputation
            }
        }

        let (mut step, _rx) = controller(
            ControllerType::Local,
            Mode::Local,
            Arc::new(ScriptedRuntime::default()),
        );
        step.control_box = Box::new(Multi);

        let err = step
            .start(Value::Null, &NoRemote, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedCommand(c) if c == "nextComputation"));
    }
}
