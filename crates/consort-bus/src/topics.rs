//! Control-channel topic names.

/// Topic names used between the remote node and its clients.
pub struct Topics;

impl Topics {
    /// Client registration requests (client → remote).
    pub const REGISTER: &'static str = "register";

    /// Client iteration data and errors (client → remote).
    pub const RUN: &'static str = "run";

    /// Client acknowledgement of a run's final transfer or error (client → remote).
    pub const FINISHED: &'static str = "finished";

    /// Registration acknowledgements for one client (remote → client).
    #[must_use]
    pub fn client_register(client_id: &str) -> String {
        format!("{client_id}-register")
    }

    /// Aggregated results and errors for one client (remote → client).
    #[must_use]
    pub fn client_run(client_id: &str) -> String {
        format!("{client_id}-run")
    }
}
