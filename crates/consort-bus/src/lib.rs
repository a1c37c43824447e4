//! # consort-bus
//!
//! Control channel for consort nodes.
//!
//! Clients publish on the shared [`Topics::REGISTER`], [`Topics::RUN`] and
//! [`Topics::FINISHED`] topics; the remote answers each client on its own
//! `<clientId>-register` and `<clientId>-run` topics. [`NatsBus`] carries the
//! traffic between processes, [`MemoryBus`] inside one process.

mod error;
mod memory;
mod nats;
mod topics;
mod traits;

pub use error::BusError;
pub use memory::{MemoryBus, MemoryChannel};
pub use nats::{NatsBus, NatsChannel, RECONNECT_DELAY};
pub use topics::Topics;
pub use traits::{Channel, MessageBus, MessageStream};
