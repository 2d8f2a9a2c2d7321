//! Core domain model types.
//!
//! This module contains the fundamental types shared by every component:
//! - Layer, stage and run status enums
//! - Quality gate results and verdicts
//! - Execution records for the audit trail
//! - Dataset references

mod dataset;
mod quality;
mod record;
mod status;

pub use dataset::DatasetRef;
pub use quality::{GateVerdict, QualityGateResult, Severity};
pub use record::{ExecutionRecord, Outcome};
pub use status::{Layer, RunStatus, StageStatus};
