//! Per-source incremental checkpoints.
//!
//! Only the executor reads and writes checkpoints, and only after a bronze
//! stage's output has been committed.

mod file;
mod store;
mod watermark;

pub use file::FileCheckpointStore;
pub use store::{CheckpointStore, InMemoryCheckpointStore};
pub use watermark::Watermark;
