//! Wire protocol for the control channel.

mod message;

pub use message::{ControlMessage, Qos};
