//! Stage definitions.

use crate::core::Layer;
use serde::{Deserialize, Serialize};

/// Deduplication settings for a silver stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Registry key of the deduplicator.
    pub method: String,
    /// Free-form settings handed to the deduplicator.
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl DedupConfig {
    /// Creates a dedup config with no settings.
    #[must_use]
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            settings: serde_json::Map::new(),
        }
    }

    /// Adds a setting.
    #[must_use]
    pub fn with_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }
}

/// Declarative definition of one pipeline stage.
///
/// Immutable once the graph is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique stage name.
    pub name: String,
    /// Medallion layer; decides which executor policy applies.
    pub layer: Layer,
    /// Upstream stages, in declaration order.
    #[serde(default, alias = "dependencies")]
    pub depends_on: Vec<String>,
    /// Registry key of the unit of work.
    pub unit: String,
    /// Checkpoint key for bronze stages. Defaults to the stage name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Registry keys of the quality checks, evaluated in order.
    #[serde(default)]
    pub quality_checks: Vec<String>,
    /// Optional deduplication step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup: Option<DedupConfig>,
    /// Free-form options passed to the unit of work.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl StageDefinition {
    /// Creates a definition whose unit key equals its name.
    #[must_use]
    pub fn new(name: impl Into<String>, layer: Layer) -> Self {
        let name = name.into();
        Self {
            unit: name.clone(),
            name,
            layer,
            depends_on: Vec::new(),
            source: None,
            quality_checks: Vec::new(),
            dedup: None,
            options: serde_json::Map::new(),
        }
    }

    /// Shorthand for a bronze stage.
    #[must_use]
    pub fn bronze(name: impl Into<String>) -> Self {
        Self::new(name, Layer::Bronze)
    }

    /// Shorthand for a silver stage.
    #[must_use]
    pub fn silver(name: impl Into<String>) -> Self {
        Self::new(name, Layer::Silver)
    }

    /// Shorthand for a gold stage.
    #[must_use]
    pub fn gold(name: impl Into<String>) -> Self {
        Self::new(name, Layer::Gold)
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    /// Sets the unit-of-work key.
    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Sets the checkpoint source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Adds a quality check reference.
    #[must_use]
    pub fn with_check(mut self, check: impl Into<String>) -> Self {
        self.quality_checks.push(check.into());
        self
    }

    /// Sets the deduplication step.
    #[must_use]
    pub fn with_dedup(mut self, dedup: DedupConfig) -> Self {
        self.dedup = Some(dedup);
        self
    }

    /// Adds a unit option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// The checkpoint key for this stage.
    #[must_use]
    pub fn source_id(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_defaults_to_name() {
        let stage = StageDefinition::bronze("orders_raw");
        assert_eq!(stage.source_id(), "orders_raw");
        assert_eq!(stage.with_source("orders").source_id(), "orders");
    }

    #[test]
    fn test_deserialize_minimal() {
        let stage: StageDefinition = serde_json::from_value(serde_json::json!({
            "name": "curated",
            "layer": "silver",
            "unit": "transform_orders",
            "dependencies": ["raw"],
            "dedup": {"method": "splink"}
        }))
        .unwrap();

        assert_eq!(stage.layer, Layer::Silver);
        assert_eq!(stage.depends_on, vec!["raw"]);
        assert_eq!(stage.dedup.unwrap().method, "splink");
        assert!(stage.quality_checks.is_empty());
    }
}
