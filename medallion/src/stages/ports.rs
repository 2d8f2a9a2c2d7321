//! Capability interfaces the executor depends on.
//!
//! The orchestrator never sees concrete transforms, connectors or check
//! engines; it calls these traits through the [`super::Registry`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::checkpoint::Watermark;
use crate::core::{DatasetRef, QualityGateResult};
use crate::errors::MedallionError;
use crate::pipeline::StageDefinition;

/// Everything a unit of work, check or deduplicator may know about the
/// invocation it serves.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// The run being executed.
    pub run_id: String,
    /// The stage definition.
    pub stage: Arc<StageDefinition>,
    /// Delivery attempt.
    pub attempt: u32,
    /// Checkpoint baseline for bronze stages; rows at or below it are old.
    pub since: Option<Watermark>,
    /// Where the unit must write its output.
    pub staging: DatasetRef,
    /// Committed outputs of the upstream stages, keyed by stage name.
    pub inputs: BTreeMap<String, DatasetRef>,
}

impl StageContext {
    /// Creates a context with no baseline and no inputs.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        stage: Arc<StageDefinition>,
        attempt: u32,
        staging: DatasetRef,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            stage,
            attempt,
            since: None,
            staging,
            inputs: BTreeMap::new(),
        }
    }

    /// Sets the checkpoint baseline.
    #[must_use]
    pub fn with_since(mut self, since: Option<Watermark>) -> Self {
        self.since = since;
        self
    }

    /// Sets the upstream inputs.
    #[must_use]
    pub fn with_inputs(mut self, inputs: BTreeMap<String, DatasetRef>) -> Self {
        self.inputs = inputs;
        self
    }

    /// The stage name.
    #[must_use]
    pub fn stage_name(&self) -> &str {
        &self.stage.name
    }
}

/// What a unit of work reports after writing its output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOutput {
    /// Rows written.
    #[serde(default)]
    pub rows: u64,
    /// Highest incremental key in the written batch (bronze only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_watermark: Option<Watermark>,
}

impl WorkOutput {
    /// Creates an output without a watermark.
    #[must_use]
    pub fn rows(rows: u64) -> Self {
        Self {
            rows,
            max_watermark: None,
        }
    }

    /// Sets the batch watermark.
    #[must_use]
    pub fn with_watermark(mut self, watermark: Watermark) -> Self {
        self.max_watermark = Some(watermark);
        self
    }
}

/// An extraction, transformation or aggregation step.
///
/// Implementations must be idempotent for a given `(staging, since)` pair:
/// redelivery re-runs them against the same window.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Materialises the stage output at `ctx.staging`.
    async fn run(&self, ctx: &StageContext) -> Result<WorkOutput, MedallionError>;
}

/// A data-quality evaluator.
#[async_trait]
pub trait QualityCheck: Send + Sync {
    /// Evaluates `dataset` and returns results in evaluation order.
    async fn evaluate(
        &self,
        ctx: &StageContext,
        dataset: &DatasetRef,
    ) -> Result<Vec<QualityGateResult>, MedallionError>;
}

/// A deduplication step applied in place to a staged silver dataset.
#[async_trait]
pub trait Deduplicator: Send + Sync {
    /// Deduplicates `dataset` according to `settings`.
    async fn deduplicate(
        &self,
        ctx: &StageContext,
        dataset: &DatasetRef,
        settings: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), MedallionError>;
}

/// Staged-then-committed storage for stage outputs.
///
/// Nothing written to a staging location is visible to downstream stages
/// until [`OutputStore::commit`] returns.
#[async_trait]
pub trait OutputStore: Send + Sync {
    /// Allocates a fresh staging location for one attempt.
    async fn staging_location(
        &self,
        run_id: &str,
        stage: &StageDefinition,
        attempt: u32,
    ) -> Result<DatasetRef, MedallionError>;

    /// Publishes a staged output at a location owned by `run_id`.
    ///
    /// A later commit by the same run replaces it; commits by other runs
    /// never touch it. The published output also becomes the stage's
    /// latest committed output.
    async fn commit(
        &self,
        run_id: &str,
        stage: &StageDefinition,
        staged: &DatasetRef,
    ) -> Result<DatasetRef, MedallionError>;

    /// Drops a staged output.
    async fn discard(&self, staged: &DatasetRef) -> Result<(), MedallionError>;

    /// The stage's most recently committed output across all runs, if any.
    ///
    /// Only used for dependencies that are not part of the current run.
    async fn committed(&self, stage: &StageDefinition)
        -> Result<Option<DatasetRef>, MedallionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_output_from_command_json() {
        let out: WorkOutput = serde_json::from_str(r#"{"rows": 3, "max_watermark": 105}"#).unwrap();
        assert_eq!(out, WorkOutput::rows(3).with_watermark(Watermark::Integer(105)));

        let empty: WorkOutput = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, WorkOutput::default());
    }

    #[test]
    fn test_context_builders() {
        let stage = Arc::new(StageDefinition::bronze("orders_raw"));
        let ctx = StageContext::new("r1", stage, 2, DatasetRef::new("mem://staging"))
            .with_since(Some(Watermark::Integer(100)));

        assert_eq!(ctx.stage_name(), "orders_raw");
        assert_eq!(ctx.since, Some(Watermark::Integer(100)));
        assert!(ctx.inputs.is_empty());
    }
}
