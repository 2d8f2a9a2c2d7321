//! Pipeline runs and their storage.

mod file;
mod model;
mod store;

pub use file::FileRunStore;
pub use model::{
    BeginOutcome, CompleteOutcome, FailOutcome, PipelineRun, RunFailure, StageState, Transition,
};
pub use store::{wait_for_terminal, InMemoryRunStore, RunStore};
