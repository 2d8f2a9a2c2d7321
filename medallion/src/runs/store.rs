//! Run persistence.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{BeginOutcome, CompleteOutcome, FailOutcome, PipelineRun};
use crate::core::DatasetRef;
use crate::errors::MedallionError;

/// Protocol for run storage backends.
///
/// Every mutation is atomic per run, which is what makes the status check
/// in [`RunStore::begin_stage`] a reliable idempotency boundary.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Stores a new run.
    async fn insert(&self, run: PipelineRun) -> Result<(), MedallionError>;

    /// Reads a run.
    async fn get(&self, run_id: &str) -> Result<Option<PipelineRun>, MedallionError>;

    /// Lists every run.
    async fn list(&self) -> Result<Vec<PipelineRun>, MedallionError>;

    /// See [`PipelineRun::begin`].
    async fn begin_stage(
        &self,
        run_id: &str,
        stage: &str,
        attempt: u32,
    ) -> Result<BeginOutcome, MedallionError>;

    /// See [`PipelineRun::complete`].
    async fn complete_stage(
        &self,
        run_id: &str,
        stage: &str,
        output: Option<DatasetRef>,
    ) -> Result<CompleteOutcome, MedallionError>;

    /// See [`PipelineRun::fail`].
    async fn fail_stage(
        &self,
        run_id: &str,
        stage: &str,
        reason: &str,
    ) -> Result<FailOutcome, MedallionError>;

    /// See [`PipelineRun::release`].
    async fn release_stage(&self, run_id: &str, stage: &str) -> Result<(), MedallionError>;

    /// See [`PipelineRun::mark_dispatched`].
    async fn mark_dispatched(&self, run_id: &str, stage: &str) -> Result<(), MedallionError>;

    /// See [`PipelineRun::undispatched_dependents`].
    async fn undispatched_dependents(
        &self,
        run_id: &str,
        stage: &str,
    ) -> Result<Vec<String>, MedallionError>;
}

/// In-memory run store.
///
/// With a retention limit, inserting a run evicts the oldest finished runs
/// beyond that limit. Running runs are never evicted.
#[derive(Debug, Default, Clone)]
pub struct InMemoryRunStore {
    runs: Arc<DashMap<String, PipelineRun>>,
    retain_finished: Option<usize>,
}

impl InMemoryRunStore {
    /// Creates an empty store that keeps every run.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `limit` finished runs.
    #[must_use]
    pub fn with_retention(mut self, limit: usize) -> Self {
        self.retain_finished = Some(limit);
        self
    }

    /// Returns the number of runs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.len()
    }

    /// Returns true if no run was stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    fn with_run<T>(
        &self,
        run_id: &str,
        f: impl FnOnce(&mut PipelineRun) -> T,
    ) -> Result<T, MedallionError> {
        let mut entry = self
            .runs
            .get_mut(run_id)
            .ok_or_else(|| MedallionError::RunNotFound(run_id.to_string()))?;
        Ok(f(entry.value_mut()))
    }

    fn evict_finished(&self) {
        let Some(limit) = self.retain_finished else {
            return;
        };
        let mut finished: Vec<_> = self
            .runs
            .iter()
            .filter(|r| r.is_terminal())
            .map(|r| (r.finished_at.unwrap_or(r.created_at), r.run_id.clone()))
            .collect();
        if finished.len() <= limit {
            return;
        }
        finished.sort();
        let excess = finished.len() - limit;
        for (_, run_id) in finished.into_iter().take(excess) {
            self.runs.remove(&run_id);
        }
        tracing::debug!(evicted = excess, "Finished runs evicted");
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert(&self, run: PipelineRun) -> Result<(), MedallionError> {
        match self.runs.entry(run.run_id.clone()) {
            Entry::Occupied(_) => {
                return Err(MedallionError::Internal(format!(
                    "run '{}' already exists",
                    run.run_id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(run);
            }
        }
        self.evict_finished();
        Ok(())
    }

    async fn get(&self, run_id: &str) -> Result<Option<PipelineRun>, MedallionError> {
        Ok(self.runs.get(run_id).map(|r| r.value().clone()))
    }

    async fn list(&self) -> Result<Vec<PipelineRun>, MedallionError> {
        let mut runs: Vec<PipelineRun> = self.runs.iter().map(|r| r.value().clone()).collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.run_id.cmp(&b.run_id)));
        Ok(runs)
    }

    async fn begin_stage(
        &self,
        run_id: &str,
        stage: &str,
        attempt: u32,
    ) -> Result<BeginOutcome, MedallionError> {
        self.with_run(run_id, |run| run.begin(stage, attempt))
    }

    async fn complete_stage(
        &self,
        run_id: &str,
        stage: &str,
        output: Option<DatasetRef>,
    ) -> Result<CompleteOutcome, MedallionError> {
        self.with_run(run_id, |run| run.complete(stage, output))
    }

    async fn fail_stage(
        &self,
        run_id: &str,
        stage: &str,
        reason: &str,
    ) -> Result<FailOutcome, MedallionError> {
        self.with_run(run_id, |run| run.fail(stage, reason))
    }

    async fn release_stage(&self, run_id: &str, stage: &str) -> Result<(), MedallionError> {
        self.with_run(run_id, |run| run.release(stage))
    }

    async fn mark_dispatched(&self, run_id: &str, stage: &str) -> Result<(), MedallionError> {
        self.with_run(run_id, |run| run.mark_dispatched(stage))
    }

    async fn undispatched_dependents(
        &self,
        run_id: &str,
        stage: &str,
    ) -> Result<Vec<String>, MedallionError> {
        self.with_run(run_id, |run| run.undispatched_dependents(stage))
    }
}

/// Polls `store` until the run reaches a terminal status or `timeout` passes.
///
/// Returns the run as last observed.
///
/// # Errors
///
/// Returns [`MedallionError::RunNotFound`] if the run does not exist.
pub async fn wait_for_terminal(
    store: &dyn RunStore,
    run_id: &str,
    poll: Duration,
    timeout: Option<Duration>,
) -> Result<PipelineRun, MedallionError> {
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
    loop {
        let run = store
            .get(run_id)
            .await?
            .ok_or_else(|| MedallionError::RunNotFound(run_id.to_string()))?;
        if run.is_terminal() {
            return Ok(run);
        }
        if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
            return Ok(run);
        }
        tokio::time::sleep(poll).await;
    }
}
