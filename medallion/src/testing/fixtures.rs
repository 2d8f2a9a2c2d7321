//! Graphs and an in-process harness for end-to-end tests.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::mocks::CountingCheckpointStore;
use crate::checkpoint::Watermark;
use crate::driver::Driver;
use crate::errors::MedallionError;
use crate::executor::{Executor, ExecutorSettings, Processed, Runtime, WorkerPool};
use crate::monitor::{CollectingSink, Monitor};
use crate::pipeline::{
    BackoffStrategy, JitterStrategy, RetryConfig, StageDefinition, StageGraph, StageGraphBuilder,
};
use crate::queue::InMemoryQueue;
use crate::runs::{InMemoryRunStore, PipelineRun, RunStore};
use crate::stages::{MemoryOutputStore, Registry};

const DRAIN_STEPS: usize = 1_000;
const DRAIN_WAIT: Duration = Duration::from_millis(50);

/// `bronze -> silver -> gold`, with units of the same names, a `no_duplicates`
/// check on silver and bronze reading source `orders`.
#[must_use]
pub fn three_layer_graph() -> StageGraph {
    let stages = vec![
        StageDefinition::bronze("bronze")
            .with_unit("bronze")
            .with_source("orders"),
        StageDefinition::silver("silver")
            .depends_on("bronze")
            .with_unit("silver")
            .with_check("no_duplicates"),
        StageDefinition::gold("gold").depends_on("silver").with_unit("gold"),
    ];
    // The literal graph above is acyclic with unique names.
    match StageGraphBuilder::new("orders").stages(stages).build() {
        Ok(graph) => graph,
        Err(err) => panic!("fixture graph is invalid: {err}"),
    }
}

/// Executor settings with millisecond backoff and small waits.
#[must_use]
pub fn fast_settings() -> ExecutorSettings {
    ExecutorSettings {
        max_attempts: 3,
        retry: RetryConfig::new()
            .with_base_delay_ms(5)
            .with_max_delay_ms(20)
            .with_backoff(BackoffStrategy::Constant)
            .with_jitter(JitterStrategy::None),
        concurrency: 2,
        receive_wait: Duration::from_millis(20),
        defer_delay: Duration::from_millis(5),
    }
}

/// Builder for [`TestHarness`].
#[derive(Debug)]
pub struct HarnessBuilder {
    graph: StageGraph,
    registry: Registry,
    outputs: MemoryOutputStore,
    checkpoints: HashMap<String, Watermark>,
    settings: ExecutorSettings,
    queue_capacity: Option<usize>,
}

impl HarnessBuilder {
    /// Uses `registry` for units, checks and deduplicators.
    #[must_use]
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Shares `outputs` with the fakes that read and write it.
    #[must_use]
    pub fn outputs(mut self, outputs: MemoryOutputStore) -> Self {
        self.outputs = outputs;
        self
    }

    /// Seeds an integer checkpoint for `source`.
    #[must_use]
    pub fn checkpoint(mut self, source: impl Into<String>, value: i64) -> Self {
        self.checkpoints
            .insert(source.into(), Watermark::Integer(value));
        self
    }

    /// Overrides the executor settings.
    #[must_use]
    pub fn settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Bounds the queue at `capacity` pending messages.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Wires everything together.
    #[must_use]
    pub fn build(self) -> TestHarness {
        let registry = Arc::new(self.registry);
        let checkpoints = Arc::new(CountingCheckpointStore::with_entries(self.checkpoints));
        let queue = InMemoryQueue::new(Duration::from_secs(30), self.queue_capacity);
        let runs = InMemoryRunStore::new();
        let sink = Arc::new(CollectingSink::new());

        let runtime = Arc::new(
            Runtime::new(self.graph, Arc::clone(&registry))
                .with_checkpoints(checkpoints.clone())
                .with_queue(Arc::new(queue.clone()))
                .with_runs(Arc::new(runs.clone()))
                .with_outputs(Arc::new(self.outputs.clone()))
                .with_monitor(Monitor::new(sink.clone()))
                .with_settings(self.settings),
        );
        let executor = Arc::new(Executor::new(Arc::clone(&runtime)));

        TestHarness {
            registry,
            checkpoints,
            queue,
            runs,
            outputs: self.outputs,
            sink,
            driver: Driver::new(Arc::clone(&runtime)),
            pool: WorkerPool::new(executor),
            runtime,
        }
    }
}

/// Every in-memory component of a pipeline, with concrete handles for
/// inspection.
#[derive(Debug)]
pub struct TestHarness {
    /// Registered units.
    pub registry: Arc<Registry>,
    /// Checkpoints, counting CAS outcomes.
    pub checkpoints: Arc<CountingCheckpointStore>,
    /// The queue.
    pub queue: InMemoryQueue,
    /// Run state.
    pub runs: InMemoryRunStore,
    /// Stage outputs.
    pub outputs: MemoryOutputStore,
    /// Every monitor event.
    pub sink: Arc<CollectingSink>,
    /// The shared runtime.
    pub runtime: Arc<Runtime>,
    /// Run starter.
    pub driver: Driver,
    /// Worker pool, driven one message at a time by [`TestHarness::drain`].
    pub pool: WorkerPool,
}

impl TestHarness {
    /// Starts building a harness around `graph`.
    #[must_use]
    pub fn builder(graph: StageGraph) -> HarnessBuilder {
        HarnessBuilder {
            graph,
            registry: Registry::new(),
            outputs: MemoryOutputStore::new(),
            checkpoints: HashMap::new(),
            settings: fast_settings(),
            queue_capacity: None,
        }
    }

    /// Processes messages one at a time until the queue is idle.
    pub async fn drain(&self) -> Vec<Processed> {
        let mut processed = Vec::new();
        for _ in 0..DRAIN_STEPS {
            if self.queue.is_idle() {
                break;
            }
            if let Ok(Some(step)) = self.pool.process_next(DRAIN_WAIT).await {
                processed.push(step);
            }
        }
        processed
    }

    /// Starts a run from `start`, drains the queue and returns the run.
    pub async fn run(&self, start: &str) -> Result<PipelineRun, MedallionError> {
        let run_id = self.driver.start(start).await?;
        self.drain().await;
        self.run_state(&run_id).await
    }

    /// Rows `run` committed for `stage`, empty when it committed nothing.
    #[must_use]
    pub fn output_rows(&self, run: &PipelineRun, stage: &str) -> Vec<Value> {
        run.output(stage)
            .and_then(|output| self.outputs.rows(output))
            .unwrap_or_default()
    }

    /// Current state of `run_id`.
    pub async fn run_state(&self, run_id: &str) -> Result<PipelineRun, MedallionError> {
        self.runs
            .get(run_id)
            .await?
            .ok_or_else(|| MedallionError::RunNotFound(run_id.to_string()))
    }
}
