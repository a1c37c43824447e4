//! Control-channel message envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RunError;

/// Delivery guarantee requested for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Qos {
    /// Fire and forget
    #[default]
    AtMostOnce,
    /// Confirmed by the transport before the publish returns
    AtLeastOnce,
}

/// Envelope exchanged between nodes on the control topics.
///
/// ```text
/// { id, runId, iteration, output?, success?, error?: {message, stack}, files? }
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    /// Sender client id
    #[serde(default)]
    pub id: String,
    /// Run this message belongs to
    pub run_id: String,
    /// Iteration the payload was produced in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u64>,
    /// Computation output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Whether the sender's computation reported success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// Error, if the sender failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    /// Files announced for download/upload alongside this message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
}

impl ControlMessage {
    /// Registration request or acknowledgement.
    #[must_use]
    pub fn register(id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            run_id: run_id.into(),
            ..Default::default()
        }
    }

    /// Acknowledgement that the sender is done with a run.
    #[must_use]
    pub fn finished(id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self::register(id, run_id)
    }

    /// Iteration payload.
    #[must_use]
    pub fn data(
        id: impl Into<String>,
        run_id: impl Into<String>,
        iteration: u64,
        output: Value,
        success: bool,
    ) -> Self {
        Self {
            id: id.into(),
            run_id: run_id.into(),
            iteration: Some(iteration),
            output: Some(output),
            success: Some(success),
            ..Default::default()
        }
    }

    /// Error report.
    #[must_use]
    pub fn error(id: impl Into<String>, run_id: impl Into<String>, error: RunError) -> Self {
        Self {
            id: id.into(),
            run_id: run_id.into(),
            error: Some(error),
            ..Default::default()
        }
    }

    /// Attach announced files.
    #[must_use]
    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = Some(files);
        self
    }

    /// Attach an iteration number.
    #[must_use]
    pub fn with_iteration(mut self, iteration: u64) -> Self {
        self.iteration = Some(iteration);
        self
    }

    /// Encode for the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the output payload cannot be serialized.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from the wire.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed JSON or a missing `runId`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_field_names() {
        let msg = ControlMessage::data("site-a", "run-1", 3, json!({"beta": [1, 2]}), false)
            .with_files(vec!["local-output.tar.gz.0".into()]);
        let wire = serde_json::to_value(&msg).unwrap();

        assert_eq!(
            wire,
            json!({
                "id": "site-a",
                "runId": "run-1",
                "iteration": 3,
                "output": {"beta": [1, 2]},
                "success": false,
                "files": ["local-output.tar.gz.0"]
            })
        );
    }

    #[test]
    fn test_minimal_message_decodes() {
        let msg = ControlMessage::from_bytes(br#"{"runId":"run-1"}"#).unwrap();

        assert_eq!(msg.run_id, "run-1");
        assert!(msg.id.is_empty());
        assert!(msg.output.is_none() && msg.error.is_none() && msg.files.is_none());
    }

    #[test]
    fn test_error_message() {
        let msg = ControlMessage::error("central", "run-1", RunError::new("boom"));
        let decoded = ControlMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.id, "central");
        assert_eq!(decoded.error.unwrap().message, "boom");
    }
}
