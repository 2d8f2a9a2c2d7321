//! Stage layer and status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The medallion layer a stage belongs to.
///
/// The layer decides which policy the executor applies: checkpointing for
/// bronze, quality gates and deduplication for silver, plain composition for gold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Raw landing from a source system, extracted incrementally.
    Bronze,
    /// Cleansed and deduplicated datasets, guarded by quality checks.
    Silver,
    /// Aggregated serving datasets composed from silver outputs.
    Gold,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bronze => write!(f, "bronze"),
            Self::Silver => write!(f, "silver"),
            Self::Gold => write!(f, "gold"),
        }
    }
}

/// The status of one stage within a pipeline run.
///
/// Transitions are `pending -> running -> {succeeded, failed, skipped}`, with
/// `running -> pending` allowed when a transient failure hands the message
/// back to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage is waiting for its invocation.
    #[default]
    Pending,
    /// Stage is currently running.
    Running,
    /// Stage completed and its output is committed.
    Succeeded,
    /// Stage failed terminally.
    Failed,
    /// Stage will not run because the run failed upstream.
    Skipped,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// The overall status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// At least one stage is still pending or running.
    #[default]
    Running,
    /// Every stage in the computed order succeeded.
    Completed,
    /// A stage failed terminally; remaining stages were skipped.
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl RunStatus {
    /// Returns true once the run can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}
