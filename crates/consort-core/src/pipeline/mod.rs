//! Pipeline: runs the steps of a run in order, carrying outputs forward.

mod cache;

pub use cache::PipelineCache;

use consort_container::ContainerRuntime;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::computation::Computation;
use crate::controller::{StateSink, StepController};
use crate::error::PipelineError;
use crate::events::{PipelineStatus, StateUpdate};
use crate::remote::RemoteHandler;
use crate::types::{Mode, PipelineSpec, RunDirectories};

const EVENT_CAPACITY: usize = 1024;

/// Node-level context a pipeline runs in.
#[derive(Clone)]
pub struct PipelineOptions {
    pub mode: Mode,
    pub client_id: String,
    pub directories: RunDirectories,
    pub runtime: Arc<dyn ContainerRuntime>,
}

/// Cloneable view of a running pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    run_id: String,
    status: watch::Receiver<PipelineStatus>,
    events: broadcast::Sender<StateUpdate>,
    cancel: CancellationToken,
}

impl PipelineHandle {
    /// Run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Latest status.
    #[must_use]
    pub fn status(&self) -> PipelineStatus {
        self.status.borrow().clone()
    }

    /// Iteration of the step currently executing.
    #[must_use]
    pub fn current_iteration(&self) -> u64 {
        self.status.borrow().current_iteration
    }

    /// Subscribe to state updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateUpdate> {
        self.events.subscribe()
    }

    /// Sender side of the update stream, for re-emitting enriched updates.
    #[must_use]
    pub fn events(&self) -> &broadcast::Sender<StateUpdate> {
        &self.events
    }

    /// Ask the running step to stop. Completed steps are not affected.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether [`PipelineHandle::stop`] was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// An ordered list of step controllers sharing one cache.
pub struct Pipeline {
    id: String,
    spec: PipelineSpec,
    mode: Mode,
    steps: Vec<StepController>,
    cache: PipelineCache,
    handle: PipelineHandle,
}

impl Pipeline {
    /// Build the step controllers of `spec` for run `run_id`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidSpec`] if the spec fails validation.
    pub fn new(
        spec: PipelineSpec,
        run_id: impl Into<String>,
        options: PipelineOptions,
    ) -> Result<Self, PipelineError> {
        spec.validate()?;
        let id = run_id.into();

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status_tx, status_rx) = watch::channel(PipelineStatus::default());
        let status_tx = Arc::new(status_tx);

        let steps = spec
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                let computation = Computation::new(
                    step.computations[0].clone(),
                    options.mode,
                    id.clone(),
                    options.client_id.clone(),
                    index,
                    options.directories.clone(),
                    options.runtime.clone(),
                );
                let sink = StateSink {
                    run_id: id.clone(),
                    step: index,
                    events: events.clone(),
                    status: status_tx.clone(),
                };
                StepController::new(step.controller.kind, computation, options.mode, sink)
            })
            .collect();

        Ok(Self {
            handle: PipelineHandle {
                run_id: id.clone(),
                status: status_rx,
                events,
                cancel: CancellationToken::new(),
            },
            id,
            spec,
            mode: options.mode,
            steps,
            cache: PipelineCache::new(),
        })
    }

    /// Run id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handle for observing and stopping the pipeline.
    #[must_use]
    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Run every step in order and return the last step's output.
    ///
    /// # Errors
    ///
    /// Fails with the first step error; later steps do not run.
    #[instrument(skip(self, remote), fields(run_id = %self.id, steps = self.steps.len()))]
    pub async fn run(mut self, remote: Arc<dyn RemoteHandler>) -> Result<Value, PipelineError> {
        let cancel = self.handle.cancel.clone();
        let mut last = Value::Null;

        for (index, step) in self.steps.iter_mut().enumerate() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Stopped);
            }
            let input = self
                .cache
                .resolve(&self.spec.steps[index].input_map, self.mode)?;
            info!(step = index, "Starting step");

            step.seed_cache(self.cache.merged());
            let output = step.start(input, remote.as_ref(), &cancel).await?;
            self.cache.record(output.clone(), step.cache());
            last = output;
        }
        Ok(last)
    }
}
