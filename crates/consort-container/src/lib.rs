//! # consort-container
//!
//! Container execution adapter for consort pipeline steps.
//!
//! The engine never talks to a container daemon directly. It hands a
//! [`ContainerSpec`] to a [`ContainerRuntime`] and gets back whatever the
//! computation wrote to stdout and stderr.
//!
//! ## Features
//!
//! - `process` (default) - Local process execution (for development)
//! - `docker` (default) - Docker Engine API over HTTP
//!
//! ## Example
//!
//! ```rust,no_run
//! use consort_container::{ContainerRuntime, ContainerSpec, ProcessRuntime};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = ProcessRuntime::new();
//!     let spec = ContainerSpec {
//!         name: "hello".into(),
//!         command: vec!["echo".into(), "{\"output\":{}}".into()],
//!         ..Default::default()
//!     };
//!
//!     let out = runtime.run_container(&spec).await?;
//!     println!("Output: {}", out.stdout);
//!
//!     Ok(())
//! }
//! ```

mod demux;
mod error;
mod traits;

#[cfg(feature = "process")]
mod process;

#[cfg(feature = "docker")]
mod docker;

pub use demux::{DemuxedOutput, FrameDemuxer, StreamKind};
pub use error::ContainerError;
pub use traits::{ContainerOutput, ContainerRuntime, ContainerSpec, Mount};

#[cfg(feature = "process")]
pub use process::ProcessRuntime;

#[cfg(feature = "docker")]
pub use docker::{DockerConfig, DockerRuntime, DockerRuntimeBuilder};
