//! # consort-core
//!
//! Execution core of the consort decentralized pipeline engine.
//!
//! This crate provides:
//! - [`Pipeline`] - Runs the steps of one run in order, carrying outputs forward
//! - [`StepController`] - Drives one step through its iterations
//! - [`ControlBox`] - Per-controller-type iteration policy (`local`, `decentralized`)
//! - [`RemoteHandler`] - Hook through which a step exchanges results with its peers
//! - [`ControlMessage`] - Envelope exchanged on the control channel
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use consort_container::ProcessRuntime;
//! use consort_core::{Mode, NoRemote, Pipeline, PipelineOptions, PipelineSpec, RunDirectories};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let spec: PipelineSpec = serde_json::from_str(&std::fs::read_to_string("pipeline.json")?)?;
//!     let options = PipelineOptions {
//!         mode: Mode::Local,
//!         client_id: "site-a".into(),
//!         directories: RunDirectories::new(Path::new("./"), "site-a", "run-1"),
//!         runtime: Arc::new(ProcessRuntime::new()),
//!     };
//!
//!     let output = Pipeline::new(spec, "run-1", options)?
//!         .run(Arc::new(NoRemote))
//!         .await?;
//!     println!("{output}");
//!     Ok(())
//! }
//! ```

pub mod computation;
pub mod controller;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod protocol;
pub mod remote;
pub mod types;

pub use computation::{Computation, ComputationInput, ComputationOutput};
pub use controller::{
    ControlBox, ControllerState, DecentralizedBox, LocalBox, PhaseCommand, StepController,
    StepOutput, StepState,
};
pub use error::{PipelineError, RunError};
pub use events::{PipelineStatus, StateUpdate};
pub use pipeline::{Pipeline, PipelineCache, PipelineHandle, PipelineOptions};
pub use protocol::{ControlMessage, Qos};
pub use remote::{NoRemote, RemoteHandler, RemoteKind, RemoteRequest, RemoteResponse};
pub use types::{
    CacheRef, ComputationDescriptor, ControllerDescriptor, ControllerType, InputSource, Mode,
    PipelineSpec, RemoteComputation, RunDirectories, StepSpec,
};
