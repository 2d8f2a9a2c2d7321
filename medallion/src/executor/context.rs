//! Shared clients and the per-invocation context threaded through them.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
use crate::config::PipelineConfig;
use crate::core::{ExecutionRecord, Outcome};
use crate::errors::MedallionError;
use crate::monitor::Monitor;
use crate::pipeline::{RetryConfig, StageDefinition, StageGraph};
use crate::queue::{InMemoryQueue, QueueChannel, QueueMessage};
use crate::runs::{FileRunStore, InMemoryRunStore, RunStore};
use crate::stages::{LocalOutputStore, MemoryOutputStore, OutputStore, Registry};

/// Tunables for the executor and worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Deliveries after which a transiently failing message is dead-lettered.
    pub max_attempts: u32,
    /// Redelivery backoff.
    pub retry: RetryConfig,
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// How long a worker blocks on an empty queue.
    pub receive_wait: Duration,
    /// Delay before a message blocked by the in-flight guard is redelivered.
    pub defer_delay: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry: RetryConfig::default(),
            concurrency: 4,
            receive_wait: Duration::from_millis(500),
            defer_delay: Duration::from_millis(250),
        }
    }
}

impl ExecutorSettings {
    /// Settings taken from a pipeline configuration.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.queue.max_attempts,
            retry: config.retry.clone(),
            concurrency: config.workers.concurrency,
            receive_wait: Duration::from_millis(config.workers.receive_wait_ms),
            ..Self::default()
        }
    }
}

/// Every client an invocation may touch.
///
/// Built once per process and shared behind an `Arc`; nothing here is a
/// process-wide singleton.
pub struct Runtime {
    /// The validated stage graph.
    pub graph: Arc<StageGraph>,
    /// Units, checks and deduplicators.
    pub registry: Arc<Registry>,
    /// Bronze watermarks.
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// The invocation channel.
    pub queue: Arc<dyn QueueChannel>,
    /// Pipeline run state.
    pub runs: Arc<dyn RunStore>,
    /// Staged and committed stage outputs.
    pub outputs: Arc<dyn OutputStore>,
    /// Audit trail.
    pub monitor: Monitor,
    /// Executor tunables.
    pub settings: ExecutorSettings,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("pipeline", &self.graph.name())
            .field("stages", &self.graph.len())
            .field("registry", &self.registry)
            .field("monitor", &self.monitor)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Creates a runtime with in-memory stores, queue and outputs.
    #[must_use]
    pub fn new(graph: StageGraph, registry: Arc<Registry>) -> Self {
        Self {
            graph: Arc::new(graph),
            registry,
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            queue: Arc::new(InMemoryQueue::default()),
            runs: Arc::new(InMemoryRunStore::new()),
            outputs: Arc::new(MemoryOutputStore::new()),
            monitor: Monitor::default(),
            settings: ExecutorSettings::default(),
        }
    }

    /// Builds the runtime described by `config`.
    ///
    /// The graph is built and every unit, check and deduplicator reference
    /// is checked against `registry` before anything else is created.
    /// Must be called inside a tokio runtime.
    pub fn from_config(
        config: &PipelineConfig,
        registry: Arc<Registry>,
    ) -> Result<Self, MedallionError> {
        let graph = config.build_graph()?;
        registry.validate(&graph)?;

        let checkpoints: Arc<dyn CheckpointStore> = match &config.checkpoint.path {
            Some(path) => Arc::new(FileCheckpointStore::new(path)),
            None => Arc::new(InMemoryCheckpointStore::new()),
        };
        let runs: Arc<dyn RunStore> = match &config.runs.path {
            Some(dir) => Arc::new(FileRunStore::new(dir)),
            None => Arc::new(InMemoryRunStore::new().with_retention(config.runs.retain_finished)),
        };

        Ok(Self::new(graph, registry)
            .with_checkpoints(checkpoints)
            .with_runs(runs)
            .with_queue(Arc::new(InMemoryQueue::new(
                config.queue.visibility_timeout(),
                config.queue.capacity,
            )))
            .with_outputs(Arc::new(LocalOutputStore::new(
                &config.storage.staging_dir,
                &config.storage.output_dir,
            )))
            .with_monitor(Monitor::from_settings(&config.monitoring))
            .with_settings(ExecutorSettings::from_config(config)))
    }

    /// Sets the checkpoint store.
    #[must_use]
    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// Sets the queue channel.
    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn QueueChannel>) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the run store.
    #[must_use]
    pub fn with_runs(mut self, runs: Arc<dyn RunStore>) -> Self {
        self.runs = runs;
        self
    }

    /// Sets the output store.
    #[must_use]
    pub fn with_outputs(mut self, outputs: Arc<dyn OutputStore>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Sets the monitor.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = monitor;
        self
    }

    /// Sets the executor tunables.
    #[must_use]
    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }
}

/// Context for one delivered message.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// The run.
    pub run_id: String,
    /// The stage named by the message.
    pub stage: String,
    /// Delivery attempt.
    pub attempt: u32,
    /// When the executor picked the message up.
    pub started_at: DateTime<Utc>,
    /// Shared clients.
    pub runtime: Arc<Runtime>,
}

impl RunContext {
    /// Creates the context for `message`.
    #[must_use]
    pub fn new(runtime: Arc<Runtime>, message: &QueueMessage) -> Self {
        Self {
            run_id: message.run_id.clone(),
            stage: message.stage.clone(),
            attempt: message.attempt,
            started_at: Utc::now(),
            runtime,
        }
    }

    /// The stage definition, if the graph defines it.
    #[must_use]
    pub fn definition(&self) -> Option<Arc<StageDefinition>> {
        self.runtime.graph.stage(&self.stage).cloned()
    }

    /// A record for this invocation ending now.
    #[must_use]
    pub fn record(&self, outcome: Outcome) -> ExecutionRecord {
        ExecutionRecord::new(
            &self.run_id,
            &self.stage,
            self.attempt,
            self.started_at,
            outcome,
        )
    }

    /// A message invoking `stage` in the same run.
    #[must_use]
    pub fn chained(&self, stage: &str) -> QueueMessage {
        QueueMessage::new(&self.run_id, stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandSpec, PipelineConfig};
    use crate::pipeline::{StageDefinition, StageGraphBuilder};

    #[test]
    fn test_run_context_records() {
        let graph = StageGraphBuilder::new("p")
            .stage(StageDefinition::bronze("raw"))
            .build()
            .unwrap();
        let runtime = Arc::new(Runtime::new(graph, Arc::new(Registry::new())));
        let mut message = QueueMessage::new("r1", "raw");
        message.attempt = 3;

        let ctx = RunContext::new(runtime, &message);
        assert!(ctx.definition().is_some());

        let record = ctx.record(Outcome::Skipped);
        assert_eq!(record.stage, "raw");
        assert_eq!(record.attempt, 3);
        assert_eq!(ctx.chained("next").attempt, 1);
    }

    #[tokio::test]
    async fn test_from_config_rejects_unregistered_units() {
        let config = PipelineConfig::new("p", vec![StageDefinition::bronze("raw")]);
        let err = Runtime::from_config(&config, Arc::new(Registry::new())).unwrap_err();
        assert!(err.to_string().contains("unit 'raw'"));
    }

    #[tokio::test]
    async fn test_from_config_uses_settings() {
        let mut config = PipelineConfig::new("p", vec![StageDefinition::bronze("raw")]);
        config.queue.max_attempts = 2;
        config.units.insert("raw".into(), CommandSpec::new("true"));
        let registry = Arc::new(Registry::new());
        crate::stages::register_commands(&registry, &config);

        let runtime = Runtime::from_config(&config, registry).unwrap();
        assert_eq!(runtime.settings.max_attempts, 2);
        assert_eq!(runtime.graph.len(), 1);
    }

    #[tokio::test]
    async fn test_from_config_persists_runs_under_runs_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::new("p", vec![StageDefinition::bronze("raw")]);
        config.units.insert("raw".into(), CommandSpec::new("true"));
        config.runs.path = Some(dir.path().join("runs"));
        let registry = Arc::new(Registry::new());
        crate::stages::register_commands(&registry, &config);

        let runtime = Arc::new(Runtime::from_config(&config, registry).unwrap());
        let run_id = crate::driver::Driver::new(Arc::clone(&runtime))
            .start("all")
            .await
            .unwrap();

        assert!(dir.path().join("runs").join(format!("{run_id}.json")).exists());
        assert_eq!(runtime.runs.list().await.unwrap().len(), 1);
    }
}
