//! Stage definitions and the stage DAG.
//!
//! This module provides:
//! - Stage definitions as loaded from configuration
//! - A validating graph builder
//! - Deterministic execution ordering
//! - Redelivery backoff policy

mod builder;
mod dag;
mod retry;
mod spec;

pub use builder::{StageGraphBuilder, ALL_STAGES};
pub use dag::StageGraph;
pub use retry::{BackoffStrategy, JitterStrategy, RetryConfig};
pub use spec::{DedupConfig, StageDefinition};
