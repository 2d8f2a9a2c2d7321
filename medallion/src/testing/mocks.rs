//! Fake units, checks, deduplicators and stores for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Barrier;

use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore, Watermark};
use crate::core::{DatasetRef, QualityGateResult};
use crate::errors::{DeduplicationError, MedallionError};
use crate::stages::{Deduplicator, MemoryOutputStore, QualityCheck, StageContext, UnitOfWork, WorkOutput};

/// Extraction over a fixed set of rows with an integer incremental key.
///
/// Emits the rows whose key is above the checkpoint baseline and reports
/// the highest emitted key as the batch watermark.
#[derive(Debug)]
pub struct StaticRowsExtraction {
    store: MemoryOutputStore,
    key: String,
    rows: Mutex<Vec<Value>>,
    calls: AtomicUsize,
}

impl StaticRowsExtraction {
    /// Creates an extraction keyed on `key`.
    #[must_use]
    pub fn new(store: MemoryOutputStore, key: impl Into<String>, rows: Vec<Value>) -> Self {
        Self {
            store,
            key: key.into(),
            rows: Mutex::new(rows),
            calls: AtomicUsize::new(0),
        }
    }

    /// Adds rows that later runs will see.
    pub fn push_rows(&self, rows: impl IntoIterator<Item = Value>) {
        self.rows.lock().extend(rows);
    }

    /// Number of times the unit ran.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UnitOfWork for StaticRowsExtraction {
    async fn run(&self, ctx: &StageContext) -> Result<WorkOutput, MedallionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let rows = self.rows.lock().clone();

        let mut emitted = Vec::new();
        let mut marks = Vec::new();
        for row in rows {
            let Some(key) = row.get(&self.key).and_then(Value::as_i64) else {
                continue;
            };
            let watermark = Watermark::Integer(key);
            let newer = match &ctx.since {
                Some(since) => watermark.checked_cmp(since)? == CmpOrdering::Greater,
                None => true,
            };
            if newer {
                marks.push(watermark);
                emitted.push(row);
            }
        }
        let max = Watermark::max_of(&marks)?;

        let count = emitted.len() as u64;
        self.store.write(&ctx.staging, emitted);
        Ok(WorkOutput {
            rows: count,
            max_watermark: max,
        })
    }
}

/// Concatenates every upstream output into the staging dataset.
#[derive(Debug, Clone)]
pub struct PassthroughTransform {
    store: MemoryOutputStore,
}

impl PassthroughTransform {
    /// Creates a transform reading and writing `store`.
    #[must_use]
    pub fn new(store: MemoryOutputStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl UnitOfWork for PassthroughTransform {
    async fn run(&self, ctx: &StageContext) -> Result<WorkOutput, MedallionError> {
        let rows: Vec<Value> = ctx
            .inputs
            .values()
            .filter_map(|input| self.store.rows(input))
            .flatten()
            .collect();
        let count = rows.len() as u64;
        self.store.write(&ctx.staging, rows);
        Ok(WorkOutput::rows(count))
    }
}

/// Keeps the first row for each value of `key`.
#[derive(Debug, Clone)]
pub struct DedupByKey {
    store: MemoryOutputStore,
    key: String,
}

impl DedupByKey {
    /// Creates a deduplicator on `key`.
    #[must_use]
    pub fn new(store: MemoryOutputStore, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }
}

#[async_trait]
impl Deduplicator for DedupByKey {
    async fn deduplicate(
        &self,
        _ctx: &StageContext,
        dataset: &DatasetRef,
        _settings: &serde_json::Map<String, Value>,
    ) -> Result<(), MedallionError> {
        let rows = self.store.rows(dataset).unwrap_or_default();
        let mut seen = HashSet::new();
        let unique = rows
            .into_iter()
            .filter(|row| seen.insert(row.get(&self.key).map(ToString::to_string)))
            .collect();
        self.store.write(dataset, unique);
        Ok(())
    }
}

/// A deduplicator that always fails.
#[derive(Debug, Clone, Default)]
pub struct FailingDeduplicator;

#[async_trait]
impl Deduplicator for FailingDeduplicator {
    async fn deduplicate(
        &self,
        ctx: &StageContext,
        _dataset: &DatasetRef,
        _settings: &serde_json::Map<String, Value>,
    ) -> Result<(), MedallionError> {
        Err(DeduplicationError {
            stage: ctx.stage.name.clone(),
            method: "failing".into(),
            message: "blocking rules produced no candidate pairs".into(),
        }
        .into())
    }
}

/// A check returning fixed results.
#[derive(Debug, Default)]
pub struct StaticCheck {
    results: Vec<QualityGateResult>,
    calls: AtomicUsize,
}

impl StaticCheck {
    /// Creates a check returning `results`.
    #[must_use]
    pub fn new(results: Vec<QualityGateResult>) -> Self {
        Self {
            results,
            calls: AtomicUsize::new(0),
        }
    }

    /// A check that passes under `name`.
    #[must_use]
    pub fn passing(name: &str) -> Self {
        Self::new(vec![QualityGateResult::pass(name)])
    }

    /// Number of evaluations.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QualityCheck for StaticCheck {
    async fn evaluate(
        &self,
        _ctx: &StageContext,
        _dataset: &DatasetRef,
    ) -> Result<Vec<QualityGateResult>, MedallionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.results.clone())
    }
}

/// Fails transiently a fixed number of times, then delegates.
pub struct FlakyUnit {
    inner: Arc<dyn UnitOfWork>,
    failures_left: AtomicU32,
    calls: AtomicUsize,
}

impl FlakyUnit {
    /// Fails the first `failures` calls.
    #[must_use]
    pub fn new(inner: Arc<dyn UnitOfWork>, failures: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    /// Never succeeds.
    #[must_use]
    pub fn always(inner: Arc<dyn UnitOfWork>) -> Self {
        Self::new(inner, u32::MAX)
    }

    /// Number of calls, failed or not.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UnitOfWork for FlakyUnit {
    async fn run(&self, ctx: &StageContext) -> Result<WorkOutput, MedallionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(MedallionError::transient(ctx.stage_name(), "source unreachable"));
        }
        self.inner.run(ctx).await
    }
}

/// Fails terminally on every call.
#[derive(Debug, Clone)]
pub struct FailingUnit {
    message: String,
}

impl FailingUnit {
    /// Creates a unit failing with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl UnitOfWork for FailingUnit {
    async fn run(&self, _ctx: &StageContext) -> Result<WorkOutput, MedallionError> {
        Err(MedallionError::Internal(self.message.clone()))
    }
}

/// Holds its first `parties` calls at a barrier before delegating, so
/// concurrent invocations overlap.
pub struct GatedUnit {
    inner: Arc<dyn UnitOfWork>,
    barrier: Barrier,
    gated: AtomicUsize,
}

impl GatedUnit {
    /// Gates the first `parties` calls.
    #[must_use]
    pub fn new(inner: Arc<dyn UnitOfWork>, parties: usize) -> Self {
        Self {
            inner,
            barrier: Barrier::new(parties),
            gated: AtomicUsize::new(parties),
        }
    }
}

#[async_trait]
impl UnitOfWork for GatedUnit {
    async fn run(&self, ctx: &StageContext) -> Result<WorkOutput, MedallionError> {
        let gate = self
            .gated
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if gate {
            self.barrier.wait().await;
        }
        self.inner.run(ctx).await
    }
}

/// In-memory checkpoint store counting compare-and-set outcomes.
#[derive(Debug, Default)]
pub struct CountingCheckpointStore {
    inner: InMemoryCheckpointStore,
    applied: AtomicUsize,
    rejected: AtomicUsize,
}

impl CountingCheckpointStore {
    /// Creates a store pre-loaded with `entries`.
    #[must_use]
    pub fn with_entries(entries: HashMap<String, Watermark>) -> Self {
        Self {
            inner: InMemoryCheckpointStore::with_entries(entries),
            ..Self::default()
        }
    }

    /// Successful writes.
    #[must_use]
    pub fn applied(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }

    /// Rejected writes.
    #[must_use]
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointStore for CountingCheckpointStore {
    async fn get(&self, source: &str) -> Result<Option<Watermark>, MedallionError> {
        self.inner.get(source).await
    }

    async fn compare_and_set(
        &self,
        source: &str,
        expected: Option<&Watermark>,
        new: &Watermark,
    ) -> Result<bool, MedallionError> {
        let applied = self.inner.compare_and_set(source, expected, new).await?;
        if applied {
            self.applied.fetch_add(1, Ordering::SeqCst);
        } else {
            self.rejected.fetch_add(1, Ordering::SeqCst);
        }
        Ok(applied)
    }

    async fn snapshot(&self) -> Result<HashMap<String, Watermark>, MedallionError> {
        self.inner.snapshot().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageDefinition;
    use serde_json::json;

    fn ctx(since: Option<Watermark>) -> StageContext {
        StageContext::new(
            "r1",
            Arc::new(StageDefinition::bronze("orders")),
            1,
            DatasetRef::new("mem://staging/orders/r1/1"),
        )
        .with_since(since)
    }

    #[tokio::test]
    async fn test_extraction_filters_by_baseline() {
        let store = MemoryOutputStore::new();
        let unit = StaticRowsExtraction::new(
            store.clone(),
            "id",
            vec![json!({"id": 99}), json!({"id": 101}), json!({"id": 105}), json!({"id": 103})],
        );

        let ctx = ctx(Some(Watermark::Integer(100)));
        let out = unit.run(&ctx).await.unwrap();

        assert_eq!(out.rows, 3);
        assert_eq!(out.max_watermark, Some(Watermark::Integer(105)));
        assert_eq!(store.rows(&ctx.staging).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_flaky_unit_recovers() {
        let store = MemoryOutputStore::new();
        let inner = Arc::new(StaticRowsExtraction::new(store, "id", vec![]));
        let unit = FlakyUnit::new(inner, 1);

        assert!(unit.run(&ctx(None)).await.unwrap_err().is_transient());
        assert!(unit.run(&ctx(None)).await.is_ok());
        assert_eq!(unit.calls(), 2);
    }

    #[tokio::test]
    async fn test_dedup_by_key() {
        let store = MemoryOutputStore::new();
        let dataset = DatasetRef::new("mem://staging/x");
        store.write(&dataset, vec![json!({"id": 1}), json!({"id": 1}), json!({"id": 2})]);

        DedupByKey::new(store.clone(), "id")
            .deduplicate(&ctx(None), &dataset, &serde_json::Map::new())
            .await
            .unwrap();
        assert_eq!(store.rows(&dataset).unwrap().len(), 2);
    }
}
