//! Execution records written to the audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened to one executor invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The stage ran and its output was committed.
    Succeeded,
    /// The stage failed terminally.
    Failed,
    /// The invocation was dropped because a dependency had not succeeded.
    Skipped,
    /// The message was a redelivery for a stage already handled.
    Duplicate,
    /// A transient failure handed the message back for redelivery.
    Retrying,
    /// Redelivery attempts were exhausted.
    DeadLettered,
    /// The message could not be matched to a run or stage.
    Rejected,
}

impl Outcome {
    /// All outcomes, in counter display order.
    pub const ALL: [Self; 7] = [
        Self::Succeeded,
        Self::Failed,
        Self::Skipped,
        Self::Duplicate,
        Self::Retrying,
        Self::DeadLettered,
        Self::Rejected,
    ];
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Duplicate => "duplicate",
            Self::Retrying => "retrying",
            Self::DeadLettered => "dead_lettered",
            Self::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

/// One append-only audit entry per executor invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// The run the invocation belonged to.
    pub run_id: String,
    /// The stage that was invoked.
    pub stage: String,
    /// Delivery attempt of the message.
    pub attempt: u32,
    /// When the executor picked up the message.
    pub started_at: DateTime<Utc>,
    /// When the executor finished with it.
    pub ended_at: DateTime<Utc>,
    /// The outcome.
    pub outcome: Outcome,
    /// Error or skip reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Error classification from [`crate::errors::MedallionError::kind`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    /// Committed output reference, for successful stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ExecutionRecord {
    /// Creates a record that ends now.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        stage: impl Into<String>,
        attempt: u32,
        started_at: DateTime<Utc>,
        outcome: Outcome,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            stage: stage.into(),
            attempt,
            started_at,
            ended_at: Utc::now(),
            outcome,
            error: None,
            error_kind: None,
            output: None,
        }
    }

    /// Sets the error detail.
    #[must_use]
    pub fn with_error(mut self, kind: &str, error: impl Into<String>) -> Self {
        self.error_kind = Some(kind.to_string());
        self.error = Some(error.into());
        self
    }

    /// Sets a reason without an error classification (skips, duplicates).
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.error = Some(reason.into());
        self
    }

    /// Sets the committed output reference.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Duration of the invocation in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }
}
