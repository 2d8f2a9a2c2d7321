//! Error types for the medallion orchestrator.
//!
//! The taxonomy separates errors the transport should retry (transient) from
//! errors that end a run (terminal). Workers inspect [`MedallionError::is_transient`]
//! to choose between redelivery and recording a failure.

use crate::checkpoint::Watermark;
use crate::core::QualityGateResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for medallion operations.
#[derive(Debug, Error)]
pub enum MedallionError {
    /// The stage graph or pipeline configuration is invalid.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// A retryable failure inside a unit of work or a client.
    #[error("{0}")]
    TransientExecution(#[from] TransientExecutionError),

    /// Another writer moved the checkpoint between read and compare-and-set.
    #[error("{0}")]
    CheckpointConflict(#[from] CheckpointConflictError),

    /// A quality check with severity `error` did not pass.
    #[error("{0}")]
    QualityGate(#[from] QualityGateError),

    /// Deduplication of a curated dataset failed.
    #[error("{0}")]
    Deduplication(#[from] DeduplicationError),

    /// Two watermarks of different kinds were compared.
    #[error("Invalid watermark: {0}")]
    InvalidWatermark(String),

    /// The queue transport rejected an operation.
    #[error("Queue error: {0}")]
    Queue(String),

    /// A message referenced a run that does not exist.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MedallionError {
    /// Returns true when the transport should redeliver the message.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientExecution(_) | Self::CheckpointConflict(_) | Self::Io(_) | Self::Queue(_)
        )
    }

    /// Short machine-readable classification used in execution records.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::TransientExecution(_) => "transient",
            Self::CheckpointConflict(_) => "checkpoint_conflict",
            Self::QualityGate(_) => "quality_gate",
            Self::Deduplication(_) => "deduplication",
            Self::InvalidWatermark(_) => "invalid_watermark",
            Self::Queue(_) => "queue",
            Self::RunNotFound(_) => "run_not_found",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }

    /// Creates a transient error for a stage.
    #[must_use]
    pub fn transient(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientExecution(TransientExecutionError::new(stage, message))
    }
}

impl From<serde_json::Error> for MedallionError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Diagnostic metadata attached to configuration errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "CONFIG-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Errors raised while loading configuration or building the stage graph.
///
/// All of these are fatal for the driver: nothing is enqueued.
#[derive(Debug, Clone, Error)]
pub enum ConfigurationError {
    /// The stage definitions contain a dependency cycle.
    #[error("{0}")]
    Cycle(#[from] CyclicGraphError),

    /// A start stage or dependency names a stage that is not defined.
    #[error("{0}")]
    UnknownStage(#[from] UnknownStageError),

    /// Any other invalid definition (duplicates, empty graph, bad YAML...).
    #[error("{0}")]
    Invalid(#[from] InvalidConfigError),
}

impl ConfigurationError {
    /// Returns the diagnostic info for this error.
    #[must_use]
    pub fn error_info(&self) -> &ErrorInfo {
        match self {
            Self::Cycle(err) => &err.error_info,
            Self::UnknownStage(err) => &err.error_info,
            Self::Invalid(err) => &err.error_info,
        }
    }

    /// Shorthand for an [`InvalidConfigError`].
    #[must_use]
    pub fn invalid(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self::Invalid(InvalidConfigError {
            error_info: ErrorInfo::new(code, message.clone()),
            message,
            stages: Vec::new(),
        })
    }
}

/// Error raised when a cycle is detected in the stage graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in stage graph: {}", cycle_path.join(" -> "))]
pub struct CyclicGraphError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl CyclicGraphError {
    /// Creates a new cycle error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            "CONFIG-CYCLE",
            format!("Stage graph contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

/// Error raised when a stage name is not defined.
#[derive(Debug, Clone, Error)]
#[error("Unknown stage '{stage}'")]
pub struct UnknownStageError {
    /// The stage that was requested.
    pub stage: String,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl UnknownStageError {
    /// Creates a new unknown-stage error.
    #[must_use]
    pub fn new(stage: impl Into<String>) -> Self {
        let stage = stage.into();
        let info = ErrorInfo::new("CONFIG-UNKNOWN-STAGE", format!("Stage '{stage}' is not defined"))
            .with_fix_hint("Use 'all' or one of the stage names declared in the configuration.");
        Self {
            stage,
            error_info: info,
        }
    }
}

/// Error raised for structurally invalid definitions.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct InvalidConfigError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Diagnostic info.
    pub error_info: ErrorInfo,
}

impl InvalidConfigError {
    /// Creates a new invalid-config error.
    #[must_use]
    pub fn new(info: ErrorInfo, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: info,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }
}

/// A failure the transport should retry (source unreachable, storage timeout).
#[derive(Debug, Clone, Error)]
#[error("Transient failure in stage '{stage}': {message}")]
pub struct TransientExecutionError {
    /// The stage that failed.
    pub stage: String,
    /// What went wrong.
    pub message: String,
}

impl TransientExecutionError {
    /// Creates a new transient error.
    #[must_use]
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// The stored watermark changed between read and compare-and-set.
#[derive(Debug, Clone, Error)]
#[error(
    "Checkpoint conflict for source '{source_id}': expected {}, attempted {attempted}",
    expected.as_ref().map_or_else(|| "<absent>".to_string(), ToString::to_string)
)]
pub struct CheckpointConflictError {
    /// The checkpoint key.
    pub source_id: String,
    /// The baseline this writer read.
    pub expected: Option<Watermark>,
    /// The value this writer tried to store.
    pub attempted: Watermark,
}

/// One or more `error`-severity quality checks failed.
#[derive(Debug, Clone, Error)]
#[error("Quality gate failed for stage '{stage}': {}", summarize_failures(failures))]
pub struct QualityGateError {
    /// The stage whose output was rejected.
    pub stage: String,
    /// The blocking results, in evaluation order.
    pub failures: Vec<QualityGateResult>,
}

impl QualityGateError {
    /// Names of the failing checks.
    #[must_use]
    pub fn check_names(&self) -> Vec<&str> {
        self.failures.iter().map(|r| r.check.as_str()).collect()
    }
}

fn summarize_failures(failures: &[QualityGateResult]) -> String {
    failures
        .iter()
        .map(|r| {
            if r.message.is_empty() {
                r.check.clone()
            } else {
                format!("{} ({})", r.check, r.message)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Deduplication of a curated dataset failed.
#[derive(Debug, Clone, Error)]
#[error("Deduplication '{method}' failed for stage '{stage}': {message}")]
pub struct DeduplicationError {
    /// The stage being deduplicated.
    pub stage: String,
    /// The configured deduplication method.
    pub method: String,
    /// What went wrong.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Severity;

    #[test]
    fn test_cycle_error_display() {
        let err = CyclicGraphError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);

        assert!(err.to_string().contains("a -> b -> a"));
        assert_eq!(err.error_info.code, "CONFIG-CYCLE");
    }

    #[test]
    fn test_transient_classification() {
        assert!(MedallionError::transient("bronze", "timeout").is_transient());
        assert!(MedallionError::Queue("full".into()).is_transient());

        let conflict = MedallionError::from(CheckpointConflictError {
            source_id: "orders".into(),
            expected: Some(Watermark::Integer(100)),
            attempted: Watermark::Integer(105),
        });
        assert!(conflict.is_transient());
        assert_eq!(conflict.kind(), "checkpoint_conflict");

        let config = MedallionError::from(ConfigurationError::from(UnknownStageError::new("x")));
        assert!(!config.is_transient());
    }

    #[test]
    fn test_quality_gate_error_lists_checks() {
        let err = QualityGateError {
            stage: "silver".into(),
            failures: vec![QualityGateResult::new(
                "no_duplicates",
                false,
                Severity::Error,
                "2 duplicate ids",
            )],
        };

        assert_eq!(err.check_names(), vec!["no_duplicates"]);
        assert_eq!(
            err.to_string(),
            "Quality gate failed for stage 'silver': no_duplicates (2 duplicate ids)"
        );
        assert!(!MedallionError::from(err).is_transient());
    }

    #[test]
    fn test_conflict_display_absent_baseline() {
        let err = CheckpointConflictError {
            source_id: "orders".into(),
            expected: None,
            attempted: Watermark::Integer(1),
        };
        assert!(err.to_string().contains("<absent>"));
    }
}
