//! Pipeline run state and the per-stage state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::{DatasetRef, RunStatus, StageStatus};

/// Per-stage state within a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageState {
    /// Current status.
    pub status: StageStatus,
    /// Highest delivery attempt that entered `running`.
    pub attempt: u32,
    /// A chained message has been (or is about to be) sent for this stage.
    pub scheduled: bool,
    /// The chained message was handed to the queue.
    pub dispatched: bool,
    /// When the latest attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Failure or skip reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Committed output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<DatasetRef>,
}

/// One status change, kept for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// The stage that changed.
    pub stage: String,
    /// Previous status.
    pub from: StageStatus,
    /// New status.
    pub to: StageStatus,
    /// Delivery attempt that caused the change.
    pub attempt: u32,
    /// When it happened.
    pub at: DateTime<Utc>,
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// The stage that failed.
    pub stage: String,
    /// Human-readable reason.
    pub reason: String,
}

/// Result of trying to move a stage to `running`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// The stage is now `running` for this attempt.
    Started,
    /// The stage already finished; the delivery is a duplicate.
    AlreadyTerminal(StageStatus),
    /// The run already finished; nothing more will execute.
    RunFinished(RunStatus),
    /// Some in-plan dependencies have not succeeded.
    DependenciesPending(Vec<String>),
    /// Another delivery of the same stage is executing.
    InProgress {
        /// Attempt that holds the stage.
        attempt: u32,
    },
    /// The stage is not part of this run's plan.
    NotInPlan,
}

/// Result of marking a stage `succeeded`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteOutcome {
    /// Dependents that just became eligible and must be chained.
    pub ready: Vec<String>,
    /// Run status after the update.
    pub run_status: RunStatus,
    /// True if this update finished the run.
    pub run_finished: bool,
}

/// Result of marking a stage `failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailOutcome {
    /// Pending stages that were marked `skipped`.
    pub skipped: Vec<String>,
    /// True if this update finished the run.
    pub run_finished: bool,
}

/// A single invocation of the driver and everything it caused.
///
/// Created with every planned stage `pending`; the executor moves stages
/// through `pending -> running -> {succeeded, failed, skipped}`. History is
/// append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique run identifier.
    pub run_id: String,
    /// Pipeline name.
    pub pipeline: String,
    /// The start selector the run was created with.
    pub start_stage: String,
    /// Computed execution order.
    pub order: Vec<String>,
    /// In-plan dependencies per stage.
    pub dependencies: HashMap<String, Vec<String>>,
    /// Per-stage state.
    pub stages: HashMap<String, StageState>,
    /// Run status.
    pub status: RunStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure detail for failed runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    /// Status changes in order.
    #[serde(default)]
    pub history: Vec<Transition>,
}

impl PipelineRun {
    /// Creates a run with every planned stage `pending` and the plan roots
    /// marked as scheduled.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        pipeline: impl Into<String>,
        start_stage: impl Into<String>,
        order: Vec<String>,
        dependencies: HashMap<String, Vec<String>>,
    ) -> Self {
        let stages = order
            .iter()
            .map(|name| {
                let is_root = dependencies.get(name).map_or(true, Vec::is_empty);
                let state = StageState {
                    scheduled: is_root,
                    ..StageState::default()
                };
                (name.clone(), state)
            })
            .collect();

        Self {
            run_id: run_id.into(),
            pipeline: pipeline.into(),
            start_stage: start_stage.into(),
            order,
            dependencies,
            stages,
            status: RunStatus::Running,
            created_at: Utc::now(),
            finished_at: None,
            failure: None,
            history: Vec::new(),
        }
    }

    /// Status of a stage.
    #[must_use]
    pub fn stage_status(&self, stage: &str) -> Option<StageStatus> {
        self.stages.get(stage).map(|s| s.status)
    }

    /// Output this run committed for `stage`.
    #[must_use]
    pub fn output(&self, stage: &str) -> Option<&DatasetRef> {
        self.stages.get(stage).and_then(|s| s.output.as_ref())
    }

    /// Returns true when the run has finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Stage names with their status, in plan order.
    #[must_use]
    pub fn statuses(&self) -> Vec<(String, StageStatus)> {
        self.order
            .iter()
            .filter_map(|name| self.stages.get(name).map(|s| (name.clone(), s.status)))
            .collect()
    }

    /// Tries to move `stage` to `running` for `attempt`.
    pub fn begin(&mut self, stage: &str, attempt: u32) -> BeginOutcome {
        let Some(state) = self.stages.get(stage) else {
            return BeginOutcome::NotInPlan;
        };
        if state.status.is_terminal() {
            return BeginOutcome::AlreadyTerminal(state.status);
        }
        if self.status.is_terminal() {
            return BeginOutcome::RunFinished(self.status);
        }
        // A higher attempt means the previous lease expired and was redelivered.
        if state.status == StageStatus::Running && attempt <= state.attempt {
            return BeginOutcome::InProgress {
                attempt: state.attempt,
            };
        }

        let pending: Vec<String> = self
            .deps_of(stage)
            .iter()
            .filter(|dep| self.stage_status(dep) != Some(StageStatus::Succeeded))
            .cloned()
            .collect();
        if !pending.is_empty() {
            return BeginOutcome::DependenciesPending(pending);
        }

        self.transition(stage, StageStatus::Running, attempt);
        if let Some(state) = self.stages.get_mut(stage) {
            state.attempt = attempt;
            state.started_at = Some(Utc::now());
            state.scheduled = true;
        }
        BeginOutcome::Started
    }

    /// Marks `stage` succeeded and returns the dependents to chain.
    pub fn complete(&mut self, stage: &str, output: Option<DatasetRef>) -> CompleteOutcome {
        let attempt = self.stages.get(stage).map_or(0, |s| s.attempt);
        self.transition(stage, StageStatus::Succeeded, attempt);
        if let Some(state) = self.stages.get_mut(stage) {
            state.ended_at = Some(Utc::now());
            state.error = None;
            state.output = output;
        }

        if self.status.is_terminal() {
            return CompleteOutcome {
                ready: Vec::new(),
                run_status: self.status,
                run_finished: false,
            };
        }

        let ready: Vec<String> = self
            .order
            .iter()
            .filter(|candidate| self.deps_of(candidate).iter().any(|d| d == stage))
            .filter(|candidate| {
                self.stages
                    .get(*candidate)
                    .is_some_and(|s| s.status == StageStatus::Pending && !s.scheduled)
            })
            .filter(|candidate| {
                self.deps_of(candidate)
                    .iter()
                    .all(|d| self.stage_status(d) == Some(StageStatus::Succeeded))
            })
            .cloned()
            .collect();
        for name in &ready {
            if let Some(state) = self.stages.get_mut(name) {
                state.scheduled = true;
            }
        }

        let all_succeeded = self
            .stages
            .values()
            .all(|s| s.status == StageStatus::Succeeded);
        if all_succeeded {
            self.finish(RunStatus::Completed);
        }

        CompleteOutcome {
            ready,
            run_status: self.status,
            run_finished: all_succeeded,
        }
    }

    /// Marks `stage` failed, fails the run and skips every pending stage.
    pub fn fail(&mut self, stage: &str, reason: impl Into<String>) -> FailOutcome {
        let reason = reason.into();
        let attempt = self.stages.get(stage).map_or(0, |s| s.attempt);
        self.transition(stage, StageStatus::Failed, attempt);
        if let Some(state) = self.stages.get_mut(stage) {
            state.ended_at = Some(Utc::now());
            state.error = Some(reason.clone());
        }

        let run_finished = !self.status.is_terminal();
        if run_finished {
            self.failure = Some(RunFailure {
                stage: stage.to_string(),
                reason: reason.clone(),
            });
            self.finish(RunStatus::Failed);
        }

        let skip_reason = format!("run failed at stage '{stage}'");
        let pending: Vec<String> = self
            .order
            .iter()
            .filter(|name| self.stage_status(name) == Some(StageStatus::Pending))
            .cloned()
            .collect();
        for name in &pending {
            self.skip(name, &skip_reason);
        }

        FailOutcome {
            skipped: pending,
            run_finished,
        }
    }

    /// Returns a `running` stage to `pending` after a transient failure.
    ///
    /// If the run has already failed the stage is marked `skipped` instead.
    pub fn release(&mut self, stage: &str) {
        if self.stage_status(stage) != Some(StageStatus::Running) {
            return;
        }
        if self.status.is_terminal() {
            self.skip(stage, "run finished while the stage was retrying");
            return;
        }
        let attempt = self.stages.get(stage).map_or(0, |s| s.attempt);
        self.transition(stage, StageStatus::Pending, attempt);
    }

    /// Records that a chained message for `stage` reached the queue.
    pub fn mark_dispatched(&mut self, stage: &str) {
        if let Some(state) = self.stages.get_mut(stage) {
            state.dispatched = true;
        }
    }

    /// Dependents of `stage` that were scheduled but never reached the queue.
    #[must_use]
    pub fn undispatched_dependents(&self, stage: &str) -> Vec<String> {
        self.order
            .iter()
            .filter(|candidate| self.deps_of(candidate).iter().any(|d| d == stage))
            .filter(|candidate| {
                self.stages.get(*candidate).is_some_and(|s| {
                    s.status == StageStatus::Pending && s.scheduled && !s.dispatched
                })
            })
            .cloned()
            .collect()
    }

    fn deps_of(&self, stage: &str) -> &[String] {
        self.dependencies
            .get(stage)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn skip(&mut self, stage: &str, reason: &str) {
        let attempt = self.stages.get(stage).map_or(0, |s| s.attempt);
        self.transition(stage, StageStatus::Skipped, attempt);
        if let Some(state) = self.stages.get_mut(stage) {
            state.ended_at = Some(Utc::now());
            state.error = Some(reason.to_string());
        }
    }

    fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    fn transition(&mut self, stage: &str, to: StageStatus, attempt: u32) {
        if let Some(state) = self.stages.get_mut(stage) {
            let from = state.status;
            state.status = to;
            self.history.push(Transition {
                stage: stage.to_string(),
                from,
                to,
                attempt,
                at: Utc::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn chain() -> PipelineRun {
        let order = vec!["bronze".to_string(), "silver".to_string(), "gold".to_string()];
        let deps = HashMap::from([
            ("bronze".to_string(), vec![]),
            ("silver".to_string(), vec!["bronze".to_string()]),
            ("gold".to_string(), vec!["silver".to_string()]),
        ]);
        PipelineRun::new("run-1", "orders", "all", order, deps)
    }

    fn fan_in() -> PipelineRun {
        let order = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let deps = HashMap::from([
            ("a".to_string(), vec![]),
            ("b".to_string(), vec![]),
            ("c".to_string(), vec!["a".to_string(), "b".to_string()]),
        ]);
        PipelineRun::new("run-2", "p", "all", order, deps)
    }

    #[test]
    fn test_new_run_all_pending() {
        let run = chain();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.stages.values().all(|s| s.status == StageStatus::Pending));
        assert!(run.stages["bronze"].scheduled);
        assert!(!run.stages["silver"].scheduled);
    }

    #[test]
    fn test_happy_path_chains_in_order() {
        let mut run = chain();

        assert_eq!(run.begin("bronze", 1), BeginOutcome::Started);
        let done = run.complete("bronze", None);
        assert_eq!(done.ready, vec!["silver"]);
        assert!(!done.run_finished);

        assert_eq!(run.begin("silver", 1), BeginOutcome::Started);
        assert_eq!(run.complete("silver", None).ready, vec!["gold"]);

        assert_eq!(run.begin("gold", 1), BeginOutcome::Started);
        let done = run.complete("gold", Some(DatasetRef::new("out/gold")));
        assert!(done.ready.is_empty());
        assert!(done.run_finished);
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_out_of_order_delivery_reports_pending_deps() {
        let mut run = chain();
        assert_eq!(
            run.begin("silver", 1),
            BeginOutcome::DependenciesPending(vec!["bronze".to_string()])
        );
        assert_eq!(run.stage_status("silver"), Some(StageStatus::Pending));
    }

    #[test]
    fn test_duplicate_after_success() {
        let mut run = chain();
        run.begin("bronze", 1);
        run.complete("bronze", None);

        assert_eq!(
            run.begin("bronze", 2),
            BeginOutcome::AlreadyTerminal(StageStatus::Succeeded)
        );
    }

    #[test]
    fn test_concurrent_delivery_in_progress_and_takeover() {
        let mut run = chain();
        assert_eq!(run.begin("bronze", 1), BeginOutcome::Started);
        assert_eq!(run.begin("bronze", 1), BeginOutcome::InProgress { attempt: 1 });
        assert_eq!(run.begin("bronze", 2), BeginOutcome::Started);
        assert_eq!(run.stages["bronze"].attempt, 2);
    }

    #[test]
    fn test_fail_skips_pending() {
        let mut run = chain();
        run.begin("bronze", 1);
        run.complete("bronze", None);
        run.begin("silver", 1);

        let outcome = run.fail("silver", "Quality gate failed");

        assert!(outcome.run_finished);
        assert_eq!(outcome.skipped, vec!["gold"]);
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.failure.as_ref().unwrap().stage, "silver");
        assert_eq!(run.stage_status("gold"), Some(StageStatus::Skipped));
        assert_eq!(run.begin("gold", 1), BeginOutcome::AlreadyTerminal(StageStatus::Skipped));
    }

    #[test]
    fn test_fan_in_waits_for_all_dependencies() {
        let mut run = fan_in();
        assert!(run.stages["a"].scheduled && run.stages["b"].scheduled);
        assert!(!run.stages["c"].scheduled);

        run.begin("a", 1);
        assert!(run.complete("a", None).ready.is_empty());

        run.begin("b", 1);
        assert_eq!(run.complete("b", None).ready, vec!["c"]);
    }

    #[test]
    fn test_release_returns_to_pending() {
        let mut run = chain();
        run.begin("bronze", 1);
        run.release("bronze");
        assert_eq!(run.stage_status("bronze"), Some(StageStatus::Pending));
        assert_eq!(run.begin("bronze", 2), BeginOutcome::Started);
    }

    #[test]
    fn test_release_after_run_failed_skips() {
        let mut run = fan_in();
        run.begin("a", 1);
        run.begin("b", 1);
        run.fail("a", "boom");

        run.release("b");
        assert_eq!(run.stage_status("b"), Some(StageStatus::Skipped));
        assert_eq!(run.stage_status("c"), Some(StageStatus::Skipped));
    }

    #[test]
    fn test_undispatched_dependents() {
        let mut run = chain();
        run.begin("bronze", 1);
        run.complete("bronze", None);
        assert_eq!(run.undispatched_dependents("bronze"), vec!["silver"]);

        run.mark_dispatched("silver");
        assert!(run.undispatched_dependents("bronze").is_empty());
    }

    #[test]
    fn test_history_is_append_only_log() {
        let mut run = chain();
        run.begin("bronze", 1);
        run.complete("bronze", None);

        let moves: Vec<(StageStatus, StageStatus)> =
            run.history.iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            moves,
            vec![
                (StageStatus::Pending, StageStatus::Running),
                (StageStatus::Running, StageStatus::Succeeded),
            ]
        );
    }
}
