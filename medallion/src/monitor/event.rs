//! Events written to the audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{ExecutionRecord, QualityGateResult, RunStatus};

/// One entry of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// One executor invocation.
    Execution(ExecutionRecord),
    /// Quality check results of a silver stage, including warnings.
    Quality {
        /// Run identifier.
        run_id: String,
        /// Stage that was checked.
        stage: String,
        /// Results in evaluation order.
        results: Vec<QualityGateResult>,
    },
    /// A run reached a terminal status.
    RunFinished {
        /// Run identifier.
        run_id: String,
        /// Final status.
        status: RunStatus,
        /// Failure reason, if the run failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// When the run finished.
        at: DateTime<Utc>,
    },
    /// A message exhausted its attempts. This is the alertable event.
    DeadLettered {
        /// Run identifier.
        run_id: String,
        /// Stage of the message.
        stage: String,
        /// Attempt at which the message was given up.
        attempt: u32,
        /// Last error.
        reason: String,
        /// When the message was dead-lettered.
        at: DateTime<Utc>,
    },
}

impl MonitorEvent {
    /// The run this event belongs to.
    #[must_use]
    pub fn run_id(&self) -> &str {
        match self {
            Self::Execution(record) => &record.run_id,
            Self::Quality { run_id, .. }
            | Self::RunFinished { run_id, .. }
            | Self::DeadLettered { run_id, .. } => run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Outcome;

    #[test]
    fn test_events_are_tagged() {
        let record = ExecutionRecord::new("r1", "bronze", 1, Utc::now(), Outcome::Succeeded);
        let json = serde_json::to_value(MonitorEvent::Execution(record)).unwrap();
        assert_eq!(json["event"], "execution");
        assert_eq!(json["outcome"], "succeeded");

        let finished = MonitorEvent::RunFinished {
            run_id: "r1".into(),
            status: RunStatus::Failed,
            reason: Some("gate".into()),
            at: Utc::now(),
        };
        let json = serde_json::to_value(&finished).unwrap();
        assert_eq!(json["event"], "run_finished");
        assert_eq!(json["status"], "failed");
        assert_eq!(finished.run_id(), "r1");
    }
}
