//! Name-keyed registry of capability implementations.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{Deduplicator, QualityCheck, UnitOfWork};
use crate::errors::{ConfigurationError, ErrorInfo, InvalidConfigError};
use crate::pipeline::StageGraph;

/// Registry for units of work, quality checks and deduplicators.
///
/// Stage definitions refer to implementations by key; the registry is
/// validated against the graph before any run starts.
#[derive(Default)]
pub struct Registry {
    units: RwLock<HashMap<String, Arc<dyn UnitOfWork>>>,
    checks: RwLock<HashMap<String, Arc<dyn QualityCheck>>>,
    deduplicators: RwLock<HashMap<String, Arc<dyn Deduplicator>>>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("units", &self.unit_names())
            .field("checks", &self.check_names())
            .field("deduplicators", &self.deduplicator_names())
            .finish()
    }
}

fn sorted_keys<T: ?Sized>(map: &RwLock<HashMap<String, Arc<T>>>) -> Vec<String> {
    let mut keys: Vec<String> = map.read().keys().cloned().collect();
    keys.sort();
    keys
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a unit of work, replacing any previous one with that key.
    pub fn register_unit(&self, name: impl Into<String>, unit: Arc<dyn UnitOfWork>) {
        self.units.write().insert(name.into(), unit);
    }

    /// Registers a quality check. Keys may carry a `contract:` prefix.
    pub fn register_check(&self, name: impl Into<String>, check: Arc<dyn QualityCheck>) {
        self.checks.write().insert(name.into(), check);
    }

    /// Registers a deduplicator under its method name.
    pub fn register_deduplicator(&self, method: impl Into<String>, dedup: Arc<dyn Deduplicator>) {
        self.deduplicators.write().insert(method.into(), dedup);
    }

    /// Looks up a unit of work.
    #[must_use]
    pub fn unit(&self, name: &str) -> Option<Arc<dyn UnitOfWork>> {
        self.units.read().get(name).cloned()
    }

    /// Looks up a quality check.
    #[must_use]
    pub fn check(&self, name: &str) -> Option<Arc<dyn QualityCheck>> {
        self.checks.read().get(name).cloned()
    }

    /// Looks up a deduplicator.
    #[must_use]
    pub fn deduplicator(&self, method: &str) -> Option<Arc<dyn Deduplicator>> {
        self.deduplicators.read().get(method).cloned()
    }

    /// Registered unit keys, sorted.
    #[must_use]
    pub fn unit_names(&self) -> Vec<String> {
        sorted_keys(&self.units)
    }

    /// Registered check keys, sorted.
    #[must_use]
    pub fn check_names(&self) -> Vec<String> {
        sorted_keys(&self.checks)
    }

    /// Registered deduplicator keys, sorted.
    #[must_use]
    pub fn deduplicator_names(&self) -> Vec<String> {
        sorted_keys(&self.deduplicators)
    }

    /// Checks that every reference in `graph` resolves.
    ///
    /// # Errors
    ///
    /// Returns a `CONFIG-UNKNOWN-UNIT` error listing every missing reference.
    pub fn validate(&self, graph: &StageGraph) -> Result<(), ConfigurationError> {
        let mut missing = Vec::new();
        let mut stages = Vec::new();
        for stage in graph.stages() {
            let before = missing.len();
            if self.unit(&stage.unit).is_none() {
                missing.push(format!("unit '{}' (stage '{}')", stage.unit, stage.name));
            }
            for check in &stage.quality_checks {
                if self.check(check).is_none() {
                    missing.push(format!("check '{check}' (stage '{}')", stage.name));
                }
            }
            if let Some(dedup) = &stage.dedup {
                if self.deduplicator(&dedup.method).is_none() {
                    missing.push(format!(
                        "deduplicator '{}' (stage '{}')",
                        dedup.method, stage.name
                    ));
                }
            }
            if missing.len() > before {
                stages.push(stage.name.clone());
            }
        }

        if missing.is_empty() {
            return Ok(());
        }
        let message = format!("Unregistered references: {}", missing.join(", "));
        Err(InvalidConfigError::new(
            ErrorInfo::new("CONFIG-UNKNOWN-UNIT", message.clone())
                .with_fix_hint("Declare the command under units/checks/deduplicators or register an implementation."),
            message,
        )
        .with_stages(stages)
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DatasetRef, QualityGateResult};
    use crate::errors::MedallionError;
    use crate::pipeline::{DedupConfig, StageDefinition, StageGraphBuilder};
    use crate::stages::{StageContext, WorkOutput};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl UnitOfWork for Noop {
        async fn run(&self, _ctx: &StageContext) -> Result<WorkOutput, MedallionError> {
            Ok(WorkOutput::default())
        }
    }

    #[async_trait]
    impl QualityCheck for Noop {
        async fn evaluate(
            &self,
            _ctx: &StageContext,
            _dataset: &DatasetRef,
        ) -> Result<Vec<QualityGateResult>, MedallionError> {
            Ok(vec![])
        }
    }

    fn graph() -> StageGraph {
        StageGraphBuilder::new("p")
            .stage(StageDefinition::bronze("raw").with_unit("extract"))
            .stage(
                StageDefinition::silver("curated")
                    .depends_on("raw")
                    .with_unit("curate")
                    .with_check("contract:orders")
                    .with_dedup(DedupConfig::new("splink")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_validate_lists_all_missing() {
        let registry = Registry::new();
        registry.register_unit("extract", Arc::new(Noop));

        let err = registry.validate(&graph()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unit 'curate'"));
        assert!(msg.contains("check 'contract:orders'"));
        assert!(msg.contains("deduplicator 'splink'"));
        assert_eq!(err.error_info().code, "CONFIG-UNKNOWN-UNIT");
    }

    #[test]
    fn test_validate_passes_with_contract_prefix() {
        struct NoDedup;
        #[async_trait]
        impl Deduplicator for NoDedup {
            async fn deduplicate(
                &self,
                _ctx: &StageContext,
                _dataset: &DatasetRef,
                _settings: &serde_json::Map<String, serde_json::Value>,
            ) -> Result<(), MedallionError> {
                Ok(())
            }
        }

        let registry = Registry::new();
        registry.register_unit("extract", Arc::new(Noop));
        registry.register_unit("curate", Arc::new(Noop));
        registry.register_check("contract:orders", Arc::new(Noop));
        registry.register_deduplicator("splink", Arc::new(NoDedup));

        registry.validate(&graph()).unwrap();
        assert_eq!(registry.unit_names(), vec!["curate", "extract"]);
    }
}
