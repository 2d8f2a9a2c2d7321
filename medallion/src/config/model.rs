//! Typed pipeline configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::Severity;
use crate::errors::{ConfigurationError, ErrorInfo, InvalidConfigError};
use crate::pipeline::{RetryConfig, StageDefinition, StageGraph, StageGraphBuilder, ALL_STAGES};

fn default_start_stage() -> String {
    ALL_STAGES.to_string()
}

/// A pipeline declaration as loaded from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name.
    pub name: String,
    /// Start selector used when a caller does not name one.
    #[serde(default = "default_start_stage")]
    pub start_stage: String,
    /// Stage definitions in declaration order.
    pub stages: Vec<StageDefinition>,
    /// Command-backed units of work, keyed by registry name.
    #[serde(default)]
    pub units: BTreeMap<String, CommandSpec>,
    /// Command-backed quality checks, keyed by registry name.
    #[serde(default)]
    pub checks: BTreeMap<String, CommandSpec>,
    /// Command-backed deduplicators, keyed by method name.
    #[serde(default)]
    pub deduplicators: BTreeMap<String, CommandSpec>,
    /// Queue transport settings.
    #[serde(default)]
    pub queue: QueueSettings,
    /// Redelivery backoff.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Worker pool settings.
    #[serde(default)]
    pub workers: WorkerSettings,
    /// Timer-triggered driver settings.
    #[serde(default)]
    pub schedule: ScheduleSettings,
    /// Checkpoint persistence.
    #[serde(default)]
    pub checkpoint: CheckpointSettings,
    /// Run record persistence.
    #[serde(default)]
    pub runs: RunSettings,
    /// Local output store locations.
    #[serde(default)]
    pub storage: StorageSettings,
    /// Audit trail and metrics outputs.
    #[serde(default)]
    pub monitoring: MonitoringSettings,
}

/// An external program used as a unit, check or deduplicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Executable to run.
    pub program: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Kill the program after this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Severity for check results that do not state one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

impl CommandSpec {
    /// Creates a spec for `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout_secs: None,
            severity: None,
        }
    }

    /// Adds an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Effective timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(600))
    }
}

/// Queue transport settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Seconds a received message stays invisible before redelivery.
    pub visibility_timeout_secs: u64,
    /// Deliveries allowed before a message is dead-lettered.
    pub max_attempts: u32,
    /// Maximum undelivered messages; unbounded when absent.
    pub capacity: Option<usize>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 300,
            max_attempts: 5,
            capacity: None,
        }
    }
}

impl QueueSettings {
    /// The visibility timeout as a duration.
    #[must_use]
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// How long a worker waits on an empty queue before re-checking shutdown.
    pub receive_wait_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            receive_wait_ms: 500,
        }
    }
}

/// Timer-triggered driver settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    /// Seconds between scheduled runs.
    pub interval_secs: Option<u64>,
}

/// Checkpoint persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    /// JSON checkpoint file; checkpoints are kept in memory when absent.
    pub path: Option<PathBuf>,
}

/// Run record persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Directory holding one JSON file per run; runs are kept in memory when
    /// absent.
    pub path: Option<PathBuf>,
    /// Finished runs kept in memory before the oldest are evicted.
    pub retain_finished: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            path: None,
            retain_finished: 1000,
        }
    }
}

/// Local output store locations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Where uncommitted outputs are written.
    pub staging_dir: PathBuf,
    /// Where committed outputs land.
    pub output_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from(".medallion/staging"),
            output_dir: PathBuf::from(".medallion/output"),
        }
    }
}

/// Audit trail and metrics outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    /// JSON-lines file receiving one record per executor invocation.
    pub log_path: Option<PathBuf>,
    /// JSON file rewritten with outcome counters after each record.
    pub metrics_path: Option<PathBuf>,
    /// Records buffered before the monitor starts dropping.
    pub buffer_size: usize,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            log_path: None,
            metrics_path: None,
            buffer_size: 1024,
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with default runtime settings.
    #[must_use]
    pub fn new(name: impl Into<String>, stages: Vec<StageDefinition>) -> Self {
        Self {
            name: name.into(),
            start_stage: default_start_stage(),
            stages,
            units: BTreeMap::new(),
            checks: BTreeMap::new(),
            deduplicators: BTreeMap::new(),
            queue: QueueSettings::default(),
            retry: RetryConfig::default(),
            workers: WorkerSettings::default(),
            schedule: ScheduleSettings::default(),
            checkpoint: CheckpointSettings::default(),
            runs: RunSettings::default(),
            storage: StorageSettings::default(),
            monitoring: MonitoringSettings::default(),
        }
    }

    /// Validates the stage definitions and builds the graph.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for invalid stages, invalid runtime
    /// settings, or a start selector naming an unknown stage.
    pub fn build_graph(&self) -> Result<StageGraph, ConfigurationError> {
        self.validate_settings()?;
        let graph = StageGraphBuilder::new(&self.name)
            .stages(self.stages.iter().cloned())
            .build()?;
        graph.topological_order(&self.start_stage)?;
        Ok(graph)
    }

    /// Rewrites relative paths so they are relative to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let Some(path) = self.checkpoint.path.as_mut() {
            resolve(path);
        }
        if let Some(path) = self.runs.path.as_mut() {
            resolve(path);
        }
        resolve(&mut self.storage.staging_dir);
        resolve(&mut self.storage.output_dir);
        if let Some(path) = self.monitoring.log_path.as_mut() {
            resolve(path);
        }
        if let Some(path) = self.monitoring.metrics_path.as_mut() {
            resolve(path);
        }
    }

    fn validate_settings(&self) -> Result<(), ConfigurationError> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push("pipeline name must not be empty".to_string());
        }
        if self.queue.max_attempts == 0 {
            errors.push("queue.max_attempts must be > 0".to_string());
        }
        if self.queue.visibility_timeout_secs == 0 {
            errors.push("queue.visibility_timeout_secs must be > 0".to_string());
        }
        if self.queue.capacity == Some(0) {
            errors.push("queue.capacity must be > 0".to_string());
        }
        if self.workers.concurrency == 0 {
            errors.push("workers.concurrency must be > 0".to_string());
        }
        if self.schedule.interval_secs == Some(0) {
            errors.push("schedule.interval_secs must be > 0".to_string());
        }
        if self.runs.retain_finished == 0 {
            errors.push("runs.retain_finished must be > 0".to_string());
        }
        if self.monitoring.buffer_size == 0 {
            errors.push("monitoring.buffer_size must be > 0".to_string());
        }
        for (kind, commands) in [
            ("units", &self.units),
            ("checks", &self.checks),
            ("deduplicators", &self.deduplicators),
        ] {
            for (name, spec) in commands {
                if spec.program.trim().is_empty() {
                    errors.push(format!("{kind}.{name}: program must not be empty"));
                }
                if spec.timeout_secs == Some(0) {
                    errors.push(format!("{kind}.{name}: timeout_secs must be > 0"));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            let message = format!("Invalid pipeline settings: {}", errors.join("; "));
            Err(InvalidConfigError::new(
                ErrorInfo::new("CONFIG-INVALID-SETTINGS", message.clone()),
                message,
            )
            .into())
        }
    }
}
