//! Quality gate verdicts.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a failed check affects chaining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// A failure halts the run.
    #[default]
    Error,
    /// A failure is recorded but does not block the next stage.
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// The verdict of a single quality check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityGateResult {
    /// The check that produced this result.
    #[serde(alias = "name")]
    pub check: String,
    /// Whether the dataset satisfied the check.
    pub passed: bool,
    /// Severity of a failure.
    #[serde(default)]
    pub severity: Severity,
    /// Human-readable detail.
    #[serde(default)]
    pub message: String,
}

impl QualityGateResult {
    /// Creates a new result.
    #[must_use]
    pub fn new(
        check: impl Into<String>,
        passed: bool,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            check: check.into(),
            passed,
            severity,
            message: message.into(),
        }
    }

    /// A passing result.
    #[must_use]
    pub fn pass(check: impl Into<String>) -> Self {
        Self::new(check, true, Severity::Error, "")
    }

    /// Returns true if this result must stop the run.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        !self.passed && self.severity == Severity::Error
    }

    /// Returns true if this result is a non-blocking failure.
    #[must_use]
    pub fn is_warning(&self) -> bool {
        !self.passed && self.severity == Severity::Warning
    }
}

/// The collected results of every check referenced by a stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateVerdict {
    results: Vec<QualityGateResult>,
}

impl GateVerdict {
    /// Creates a verdict from results in evaluation order.
    #[must_use]
    pub fn new(results: Vec<QualityGateResult>) -> Self {
        Self { results }
    }

    /// All results.
    #[must_use]
    pub fn results(&self) -> &[QualityGateResult] {
        &self.results
    }

    /// Results that halt the run.
    #[must_use]
    pub fn blocking(&self) -> Vec<QualityGateResult> {
        self.results.iter().filter(|r| r.is_blocking()).cloned().collect()
    }

    /// Failed warnings.
    #[must_use]
    pub fn warnings(&self) -> Vec<QualityGateResult> {
        self.results.iter().filter(|r| r.is_warning()).cloned().collect()
    }

    /// Returns true if nothing blocks chaining.
    #[must_use]
    pub fn passed(&self) -> bool {
        !self.results.iter().any(QualityGateResult::is_blocking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_only_for_failed_errors() {
        assert!(QualityGateResult::new("a", false, Severity::Error, "").is_blocking());
        assert!(!QualityGateResult::new("a", false, Severity::Warning, "").is_blocking());
        assert!(!QualityGateResult::new("a", true, Severity::Error, "").is_blocking());
    }

    #[test]
    fn test_verdict_with_warning_passes() {
        let verdict = GateVerdict::new(vec![
            QualityGateResult::pass("not_null"),
            QualityGateResult::new("row_count", false, Severity::Warning, "below 100"),
        ]);

        assert!(verdict.passed());
        assert_eq!(verdict.warnings().len(), 1);
        assert!(verdict.blocking().is_empty());
    }

    #[test]
    fn test_verdict_with_error_fails() {
        let verdict = GateVerdict::new(vec![
            QualityGateResult::new("no_duplicates", false, Severity::Error, "2 duplicate ids"),
            QualityGateResult::new("freshness", false, Severity::Warning, "stale"),
        ]);

        assert!(!verdict.passed());
        assert_eq!(verdict.blocking()[0].check, "no_duplicates");
    }

    #[test]
    fn test_result_deserialize_defaults() {
        let result: QualityGateResult =
            serde_json::from_str(r#"{"name": "unique_ids", "passed": false}"#).unwrap();
        assert_eq!(result.check, "unique_ids");
        assert_eq!(result.severity, Severity::Error);
        assert!(result.message.is_empty());
    }
}
