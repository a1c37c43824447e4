//! Bus error types.

use thiserror::Error;

/// Control channel failures.
#[derive(Error, Debug)]
pub enum BusError {
    /// The initial connection to the broker failed
    #[error("Could not connect to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// The bus was disconnected, locally or by draining
    #[error("Bus disconnected: {0}")]
    Disconnected(String),

    #[error("Publish on '{topic}' failed: {reason}")]
    PublishFailed { topic: String, reason: String },

    #[error("Subscribe to '{topic}' failed: {reason}")]
    SubscribeFailed { topic: String, reason: String },

    /// A control message could not be encoded
    #[error("Could not encode control message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl BusError {
    pub(crate) fn publish(topic: &str, reason: impl ToString) -> Self {
        Self::PublishFailed {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn subscribe(topic: &str, reason: impl ToString) -> Self {
        Self::SubscribeFailed {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<BusError> for consort_core::PipelineError {
    fn from(err: BusError) -> Self {
        Self::RemoteCommunication(err.to_string())
    }
}
