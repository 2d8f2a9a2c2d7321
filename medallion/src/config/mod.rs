//! Declarative pipeline configuration.
//!
//! A pipeline is a YAML document listing stage definitions plus the runtime
//! settings for the queue, workers, checkpoints, run records, storage and
//! monitoring.
//! `${VAR}` references are substituted from the environment before parsing.

mod loader;
mod model;

pub use loader::{load_config, parse_config_str, substitute_env_vars};
pub use model::{
    CheckpointSettings, CommandSpec, MonitoringSettings, PipelineConfig, QueueSettings,
    RunSettings, ScheduleSettings, StorageSettings, WorkerSettings,
};
