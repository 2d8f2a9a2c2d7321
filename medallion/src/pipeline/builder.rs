//! Stage graph builder with validation.

use super::{StageDefinition, StageGraph};
use crate::core::Layer;
use crate::errors::{ConfigurationError, CyclicGraphError, ErrorInfo, InvalidConfigError};
use std::collections::{HashMap, HashSet};

/// Name reserved for the "every stage" start selector.
pub const ALL_STAGES: &str = "all";

/// Collects stage definitions and validates them into a [`StageGraph`].
///
/// Dependencies may reference stages declared later; everything is checked
/// in [`StageGraphBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct StageGraphBuilder {
    name: String,
    stages: Vec<StageDefinition>,
}

impl StageGraphBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// Adds a stage definition.
    #[must_use]
    pub fn stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    /// Adds several stage definitions.
    #[must_use]
    pub fn stages(mut self, stages: impl IntoIterator<Item = StageDefinition>) -> Self {
        self.stages.extend(stages);
        self
    }

    /// Validates the definitions and builds the graph.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] for an empty graph, duplicate or
    /// reserved names, unknown dependencies, layer mismatches or a cycle.
    pub fn build(self) -> Result<StageGraph, ConfigurationError> {
        if self.stages.is_empty() {
            return Err(invalid(
                ErrorInfo::new("CONFIG-EMPTY", "Cannot build an empty stage graph")
                    .with_fix_hint("Declare at least one stage."),
                "Stage graph has no stages",
                vec![],
            ));
        }

        let mut stages = self.stages;
        let mut seen = HashSet::new();
        for stage in &mut stages {
            validate_stage(stage)?;
            if !seen.insert(stage.name.clone()) {
                return Err(invalid(
                    ErrorInfo::new(
                        "CONFIG-DUPLICATE-STAGE",
                        format!("Stage '{}' is declared more than once", stage.name),
                    )
                    .with_fix_hint("Stage names must be unique."),
                    format!("Duplicate stage '{}'", stage.name),
                    vec![stage.name.clone()],
                ));
            }
            let mut deps_seen = HashSet::new();
            stage.depends_on.retain(|dep| deps_seen.insert(dep.clone()));
        }

        for stage in &stages {
            for dep in &stage.depends_on {
                if !seen.contains(dep) {
                    return Err(invalid(
                        ErrorInfo::new(
                            "CONFIG-MISSING-DEP",
                            format!("Dependency '{dep}' not found"),
                        )
                        .with_context_entry("stage", stage.name.clone())
                        .with_fix_hint("Declare the dependency or remove it from depends_on."),
                        format!("Stage '{}' depends on unknown stage '{dep}'", stage.name),
                        vec![stage.name.clone(), dep.clone()],
                    ));
                }
            }
        }

        detect_cycles(&stages)?;

        tracing::debug!(pipeline = %self.name, stages = stages.len(), "Stage graph validated");
        Ok(StageGraph::new(self.name, stages))
    }
}

fn invalid(info: ErrorInfo, message: impl Into<String>, stages: Vec<String>) -> ConfigurationError {
    ConfigurationError::Invalid(InvalidConfigError::new(info, message).with_stages(stages))
}

fn validate_stage(stage: &StageDefinition) -> Result<(), ConfigurationError> {
    if stage.name.trim().is_empty() {
        return Err(invalid(
            ErrorInfo::new("CONFIG-INVALID-STAGE", "Stage name cannot be empty"),
            "Stage name cannot be empty",
            vec![],
        ));
    }
    if stage.name == ALL_STAGES {
        return Err(invalid(
            ErrorInfo::new(
                "CONFIG-RESERVED-NAME",
                format!("'{ALL_STAGES}' is reserved for the start selector"),
            )
            .with_fix_hint("Rename the stage."),
            format!("Stage name '{ALL_STAGES}' is reserved"),
            vec![stage.name.clone()],
        ));
    }
    if stage.unit.trim().is_empty() {
        return Err(invalid(
            ErrorInfo::new(
                "CONFIG-INVALID-STAGE",
                format!("Stage '{}' has no unit of work", stage.name),
            ),
            format!("Stage '{}' has no unit of work", stage.name),
            vec![stage.name.clone()],
        ));
    }
    if stage.layer != Layer::Silver && (!stage.quality_checks.is_empty() || stage.dedup.is_some()) {
        return Err(invalid(
            ErrorInfo::new(
                "CONFIG-LAYER-MISMATCH",
                format!(
                    "Stage '{}' is {} but declares quality checks or deduplication",
                    stage.name, stage.layer
                ),
            )
            .with_fix_hint("Quality gates and deduplication apply to silver stages only."),
            format!("Quality gate declared on {} stage '{}'", stage.layer, stage.name),
            vec![stage.name.clone()],
        ));
    }
    Ok(())
}

/// Depth-first cycle search in declaration order.
fn detect_cycles(stages: &[StageDefinition]) -> Result<(), CyclicGraphError> {
    let by_name: HashMap<&str, &StageDefinition> =
        stages.iter().map(|s| (s.name.as_str(), s)).collect();
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for stage in stages {
        if !visited.contains(stage.name.as_str()) {
            if let Some(cycle) =
                dfs_cycle(&stage.name, &by_name, &mut visited, &mut rec_stack, &mut path)
            {
                return Err(CyclicGraphError::new(cycle));
            }
        }
    }
    Ok(())
}

fn dfs_cycle<'a>(
    node: &'a str,
    by_name: &HashMap<&'a str, &'a StageDefinition>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(stage) = by_name.get(node).copied() {
        for dep in &stage.depends_on {
            let dep = dep.as_str();
            if !visited.contains(dep) {
                if let Some(cycle) = dfs_cycle(dep, by_name, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(dep) {
                let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(ToString::to_string).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }
        }
    }

    path.pop();
    rec_stack.remove(node);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::DedupConfig;

    fn code(err: &ConfigurationError) -> &str {
        &err.error_info().code
    }

    #[test]
    fn test_forward_references_allowed() {
        let graph = StageGraphBuilder::new("p")
            .stage(StageDefinition::silver("silver").depends_on("bronze"))
            .stage(StageDefinition::bronze("bronze"))
            .build()
            .unwrap();

        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_empty_graph_rejected() {
        let err = StageGraphBuilder::new("p").build().unwrap_err();
        assert_eq!(code(&err), "CONFIG-EMPTY");
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let err = StageGraphBuilder::new("p")
            .stage(StageDefinition::bronze("a"))
            .stage(StageDefinition::bronze("a"))
            .build()
            .unwrap_err();
        assert_eq!(code(&err), "CONFIG-DUPLICATE-STAGE");
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let err = StageGraphBuilder::new("p")
            .stage(StageDefinition::silver("silver").depends_on("nope"))
            .build()
            .unwrap_err();
        assert_eq!(code(&err), "CONFIG-MISSING-DEP");
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = StageGraphBuilder::new("p")
            .stage(StageDefinition::bronze("a").depends_on("a"))
            .build()
            .unwrap_err();
        match err {
            ConfigurationError::Cycle(cycle) => assert_eq!(cycle.cycle_path, vec!["a", "a"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_detected() {
        let err = StageGraphBuilder::new("p")
            .stage(StageDefinition::silver("a").depends_on("c"))
            .stage(StageDefinition::silver("b").depends_on("a"))
            .stage(StageDefinition::silver("c").depends_on("b"))
            .build()
            .unwrap_err();

        assert_eq!(code(&err), "CONFIG-CYCLE");
        assert!(err.to_string().contains("a -> c -> b -> a"));
    }

    #[test]
    fn test_reserved_name_rejected() {
        let err = StageGraphBuilder::new("p")
            .stage(StageDefinition::bronze("all"))
            .build()
            .unwrap_err();
        assert_eq!(code(&err), "CONFIG-RESERVED-NAME");
    }

    #[test]
    fn test_gold_with_dedup_rejected() {
        let err = StageGraphBuilder::new("p")
            .stage(StageDefinition::gold("g").with_dedup(DedupConfig::new("exact")))
            .build()
            .unwrap_err();
        assert_eq!(code(&err), "CONFIG-LAYER-MISMATCH");
    }

    #[test]
    fn test_duplicate_dependency_entries_collapsed() {
        let graph = StageGraphBuilder::new("p")
            .stage(StageDefinition::bronze("a"))
            .stage(StageDefinition::silver("b").depends_on("a").depends_on("a"))
            .build()
            .unwrap();
        assert_eq!(graph.stage("b").unwrap().depends_on, vec!["a"]);
    }
}
