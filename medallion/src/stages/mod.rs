//! Capability interfaces and their implementations.
//!
//! Stages refer to their unit of work, quality checks and deduplicator by
//! key. The executor resolves those keys through a [`Registry`] and depends
//! only on the traits in this module.

mod command;
mod local;
mod memory;
mod ports;
mod registry;

pub use command::{register_commands, CommandCheck, CommandDeduplicator, CommandUnit};
pub use local::LocalOutputStore;
pub use memory::MemoryOutputStore;
pub use ports::{Deduplicator, OutputStore, QualityCheck, StageContext, UnitOfWork, WorkOutput};
pub use registry::Registry;
