//! # consort-manager
//!
//! Node-level orchestration for consort runs.
//!
//! A [`PipelineManager`] owns every run of one node. It creates the run's
//! working directories, drives the run's pipeline and bridges the pipeline's
//! remote exchanges onto the control bus and the file channel:
//!
//! - in `remote` mode it serves `/transfer`, listens on `register`, `run`
//!   and `finished`, aggregates client outputs and fans results back out;
//! - in `local` mode it listens on `<id>-register` and `<id>-run`, sends its
//!   own output to the remote and feeds the aggregate into the next
//!   iteration.
//!
//! ## Example
//!
//! ```rust,no_run
//! use consort_core::{Mode, PipelineSpec};
//! use consort_manager::{ManagerConfig, PipelineManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ManagerConfig::new("site-a", Mode::Local);
//!     let manager = PipelineManager::create(config).await?;
//!
//!     let spec: PipelineSpec = serde_json::from_str(&std::fs::read_to_string("pipeline.json")?)?;
//!     let run = manager.start_pipeline(spec, Vec::new(), "run-1").await?;
//!     println!("{}", run.result().await?);
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod config;
mod link;
mod local;
mod manager;
mod registry;
mod remote;
mod store;

pub use config::{ManagerConfig, TransferConfig, TransferEndpoint};
pub use manager::{ManagerBuilder, PipelineManager, RunHandle};
pub use registry::{ClientStatus, Registration, RunState};
pub use remote::OWNER_ONLY_MESSAGE;
pub use store::IoStore;
