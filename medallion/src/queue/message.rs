//! Stage-invocation wire messages.

use serde::{Deserialize, Serialize};

use crate::errors::MedallionError;

fn default_attempt() -> u32 {
    1
}

/// A request to execute one stage of one run.
///
/// Serialised as `{"run_id": .., "stage": .., "attempt": ..}`. Unknown fields
/// are ignored on decode so producers can add metadata freely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// The run the stage belongs to.
    pub run_id: String,
    /// The stage to execute.
    pub stage: String,
    /// Delivery attempt, starting at 1.
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    /// Optional free-form payload.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl QueueMessage {
    /// Creates a first-attempt message.
    #[must_use]
    pub fn new(run_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stage: stage.into(),
            attempt: 1,
            payload: serde_json::Value::Null,
        }
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Decodes a message from its JSON wire form.
    pub fn from_json(raw: &str) -> Result<Self, MedallionError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Encodes the message to its JSON wire form.
    pub fn to_json(&self) -> Result<String, MedallionError> {
        Ok(serde_json::to_string(self)?)
    }

    /// The `(run, stage)` key used for in-flight exclusion.
    #[must_use]
    pub fn key(&self) -> (String, String) {
        (self.run_id.clone(), self.stage.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decode_tolerates_unknown_fields() {
        let msg = QueueMessage::from_json(
            r#"{"run_id": "r1", "stage": "silver", "attempt": 3, "remaining": ["gold"], "config_path": "x.yaml"}"#,
        )
        .unwrap();

        assert_eq!(msg.run_id, "r1");
        assert_eq!(msg.stage, "silver");
        assert_eq!(msg.attempt, 3);
    }

    #[test]
    fn test_attempt_defaults_to_one() {
        let msg = QueueMessage::from_json(r#"{"run_id": "r1", "stage": "bronze"}"#).unwrap();
        assert_eq!(msg.attempt, 1);
    }

    #[test]
    fn test_encode_omits_null_payload() {
        let json = QueueMessage::new("r1", "gold").to_json().unwrap();
        assert_eq!(json, r#"{"run_id":"r1","stage":"gold","attempt":1}"#);
    }

    #[test]
    fn test_decode_missing_stage_fails() {
        let err = QueueMessage::from_json(r#"{"run_id": "r1"}"#).unwrap_err();
        assert_eq!(err.kind(), "serialization");
    }
}
