//! The validated stage DAG and execution ordering.

use super::builder::ALL_STAGES;
use super::StageDefinition;
use crate::errors::{ConfigurationError, CyclicGraphError, UnknownStageError};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// A directed acyclic graph of stage definitions.
///
/// Built by [`super::StageGraphBuilder`], which guarantees unique names, known
/// dependencies and acyclicity.
#[derive(Debug, Clone)]
pub struct StageGraph {
    name: String,
    stages: Vec<Arc<StageDefinition>>,
    index: HashMap<String, usize>,
    dependents: Vec<Vec<usize>>,
}

impl StageGraph {
    pub(super) fn new(name: String, stages: Vec<StageDefinition>) -> Self {
        let index: HashMap<String, usize> = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();

        let mut dependents = vec![Vec::new(); stages.len()];
        for (i, stage) in stages.iter().enumerate() {
            for dep in &stage.depends_on {
                if let Some(&d) = index.get(dep) {
                    dependents[d].push(i);
                }
            }
        }

        Self {
            name,
            stages: stages.into_iter().map(Arc::new).collect(),
            index,
            dependents,
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false for a built graph.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stage definitions in declaration order.
    pub fn stages(&self) -> impl Iterator<Item = &Arc<StageDefinition>> {
        self.stages.iter()
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&Arc<StageDefinition>> {
        self.index.get(name).map(|&i| &self.stages[i])
    }

    /// Returns true if `name` is a declared stage.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Direct dependents of a stage, in declaration order.
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.index.get(name).map_or_else(Vec::new, |&i| {
            self.dependents[i]
                .iter()
                .map(|&d| self.stages[d].name.as_str())
                .collect()
        })
    }

    /// Returns the stages reachable forward from `start` (inclusive), ordered
    /// so every stage follows its in-set dependencies.
    ///
    /// `"all"` selects every stage. Ties are broken by declaration order, so
    /// the result is stable for a fixed definition set.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownStageError`] if `start` is not declared.
    pub fn topological_order(&self, start: &str) -> Result<Vec<String>, ConfigurationError> {
        let included = self.reachable_from(start)?;

        let mut in_degree: HashMap<usize, usize> = included
            .iter()
            .map(|&i| {
                let deps = self.stages[i]
                    .depends_on
                    .iter()
                    .filter(|d| self.index.get(*d).is_some_and(|j| included.contains(j)))
                    .count();
                (i, deps)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(included.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(self.stages[i].name.clone());
            for &d in &self.dependents[i] {
                if let Some(deg) = in_degree.get_mut(&d) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(Reverse(d));
                    }
                }
            }
        }

        if order.len() < included.len() {
            let stuck: Vec<String> = included
                .iter()
                .filter(|i| !order.contains(&self.stages[**i].name))
                .map(|&i| self.stages[i].name.clone())
                .collect();
            return Err(CyclicGraphError::new(stuck).into());
        }
        Ok(order)
    }

    /// For each stage of a plan, its dependencies that are also in the plan.
    ///
    /// Dependencies outside the plan are treated as already satisfied.
    #[must_use]
    pub fn plan_dependencies(&self, order: &[String]) -> HashMap<String, Vec<String>> {
        let planned: HashSet<&str> = order.iter().map(String::as_str).collect();
        order
            .iter()
            .filter_map(|name| self.stage(name))
            .map(|stage| {
                let deps = stage
                    .depends_on
                    .iter()
                    .filter(|d| planned.contains(d.as_str()))
                    .cloned()
                    .collect();
                (stage.name.clone(), deps)
            })
            .collect()
    }

    /// Stages of a plan with no in-plan dependency, in plan order.
    #[must_use]
    pub fn plan_roots(&self, order: &[String]) -> Vec<String> {
        let deps = self.plan_dependencies(order);
        order
            .iter()
            .filter(|name| deps.get(*name).map_or(true, Vec::is_empty))
            .cloned()
            .collect()
    }

    fn reachable_from(&self, start: &str) -> Result<HashSet<usize>, ConfigurationError> {
        if start == ALL_STAGES {
            return Ok((0..self.stages.len()).collect());
        }
        let &root = self
            .index
            .get(start)
            .ok_or_else(|| UnknownStageError::new(start))?;

        let mut seen = HashSet::from([root]);
        let mut queue = VecDeque::from([root]);
        while let Some(i) = queue.pop_front() {
            for &d in &self.dependents[i] {
                if seen.insert(d) {
                    queue.push_back(d);
                }
            }
        }
        Ok(seen)
    }
}
