//! Stage execution.
//!
//! A [`WorkerPool`] pulls messages off the queue and hands each one to the
//! [`Executor`], which applies the layer policy (checkpointing for bronze,
//! quality gates and deduplication for silver, plain composition for gold)
//! and chains ready dependents on success.

mod context;
mod engine;
mod shutdown;
mod worker;

pub use context::{ExecutorSettings, RunContext, Runtime};
pub use engine::{Executor, Invocation};
pub use shutdown::ShutdownSignal;
pub use worker::{Processed, WorkerPool};
