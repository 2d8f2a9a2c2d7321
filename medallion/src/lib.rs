//! # Medallion
//!
//! A queue-chained orchestrator for bronze/silver/gold data pipelines.
//!
//! Medallion runs a declared graph of stages with:
//!
//! - **Deterministic planning**: stages execute in dependency order, ties
//!   broken by declaration order
//! - **Incremental extraction**: bronze stages read from a checkpoint and
//!   advance it with compare-and-set only after their output is committed
//! - **Quality gates**: silver stages are checked before anything is chained
//!   downstream
//! - **At-least-once chaining**: each invocation is a queue message; redelivery
//!   is detected and never runs a stage twice
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use medallion::prelude::*;
//!
//! let graph = StageGraphBuilder::new("orders")
//!     .stage(StageDefinition::bronze("orders_raw").with_unit("extract_orders"))
//!     .stage(StageDefinition::silver("orders_clean").depends_on("orders_raw"))
//!     .stage(StageDefinition::gold("daily_revenue").depends_on("orders_clean"))
//!     .build()?;
//!
//! let registry = Arc::new(Registry::new());
//! let runtime = Arc::new(Runtime::new(graph, registry));
//! let pool = WorkerPool::new(Arc::new(Executor::new(Arc::clone(&runtime))));
//! let run_id = Driver::new(runtime).start(ALL_STAGES).await?;
//! pool.run().await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod driver;
pub mod errors;
pub mod executor;
pub mod monitor;
pub mod pipeline;
pub mod queue;
pub mod runs;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::checkpoint::{
        CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, Watermark,
    };
    pub use crate::config::{load_config, PipelineConfig};
    pub use crate::core::{
        DatasetRef, ExecutionRecord, GateVerdict, Layer, Outcome, QualityGateResult, RunStatus,
        Severity, StageStatus,
    };
    pub use crate::driver::{Driver, Scheduler};
    pub use crate::errors::{
        CheckpointConflictError, ConfigurationError, DeduplicationError, MedallionError,
        QualityGateError, TransientExecutionError,
    };
    pub use crate::executor::{Executor, Invocation, Runtime, ShutdownSignal, WorkerPool};
    pub use crate::monitor::{Monitor, RecordSink};
    pub use crate::pipeline::{
        DedupConfig, StageDefinition, StageGraph, StageGraphBuilder, ALL_STAGES,
    };
    pub use crate::queue::{InMemoryQueue, QueueChannel, QueueMessage};
    pub use crate::runs::{
        wait_for_terminal, FileRunStore, InMemoryRunStore, PipelineRun, RunStore,
    };
    pub use crate::stages::{
        Deduplicator, OutputStore, QualityCheck, Registry, StageContext, UnitOfWork, WorkOutput,
    };
}
