//! Testing utilities for medallion pipelines.
//!
//! This module provides:
//! - Fake units, checks and deduplicators over a [`MemoryOutputStore`](crate::stages::MemoryOutputStore)
//! - A checkpoint store that counts compare-and-set outcomes
//! - An in-process harness that drives runs to completion

mod fixtures;
mod mocks;

pub use fixtures::{fast_settings, three_layer_graph, HarnessBuilder, TestHarness};
pub use mocks::{
    CountingCheckpointStore, DedupByKey, FailingDeduplicator, FailingUnit, FlakyUnit, GatedUnit,
    PassthroughTransform, StaticCheck, StaticRowsExtraction,
};
