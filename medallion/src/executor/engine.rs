//! Per-invocation stage execution.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{RunContext, Runtime};
use crate::checkpoint::Watermark;
use crate::core::{DatasetRef, GateVerdict, Layer, Outcome, RunStatus, StageStatus};
use crate::errors::{
    CheckpointConflictError, ConfigurationError, MedallionError, QualityGateError,
};
use crate::pipeline::StageDefinition;
use crate::queue::QueueMessage;
use crate::runs::BeginOutcome;
use crate::stages::{StageContext, UnitOfWork};

/// What one invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// The stage ran and its output was committed.
    Succeeded {
        /// Committed output.
        output: DatasetRef,
        /// Dependents whose messages were enqueued.
        chained: Vec<String>,
    },
    /// The stage failed terminally and the run is failed.
    Failed {
        /// Human-readable reason.
        reason: String,
    },
    /// A dependency had not succeeded or the run had already finished.
    Skipped {
        /// Why the invocation was dropped.
        reason: String,
    },
    /// A redelivery for a stage that already ran or is running.
    Duplicate {
        /// Status the stage was found in.
        status: StageStatus,
        /// Dependents re-enqueued because their first dispatch was lost.
        rechained: Vec<String>,
    },
    /// The message named an unknown run or stage.
    Rejected {
        /// Why the message was rejected.
        reason: String,
    },
}

impl Invocation {
    /// The audit outcome this invocation is recorded under.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::Succeeded { .. } => Outcome::Succeeded,
            Self::Failed { .. } => Outcome::Failed,
            Self::Skipped { .. } => Outcome::Skipped,
            Self::Duplicate { .. } => Outcome::Duplicate,
            Self::Rejected { .. } => Outcome::Rejected,
        }
    }
}

/// Consumes one queue message at a time.
///
/// Terminal stage failures are returned as [`Invocation::Failed`]; only
/// errors the transport should redeliver are returned as `Err`.
#[derive(Debug, Clone)]
pub struct Executor {
    runtime: Arc<Runtime>,
}

impl Executor {
    /// Creates an executor over `runtime`.
    #[must_use]
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// The shared clients.
    #[must_use]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Handles one delivered message.
    ///
    /// # Errors
    ///
    /// Returns a transient error when the message must be redelivered. The
    /// stage is handed back to `pending` first.
    pub async fn handle(&self, message: &QueueMessage) -> Result<Invocation, MedallionError> {
        let ctx = RunContext::new(Arc::clone(&self.runtime), message);
        let Some(stage) = ctx.definition() else {
            let reason = format!("stage '{}' is not defined", ctx.stage);
            return Ok(self.reject(&ctx, reason).await);
        };

        let begin = match self
            .runtime
            .runs
            .begin_stage(&ctx.run_id, &ctx.stage, ctx.attempt)
            .await
        {
            Ok(begin) => begin,
            Err(MedallionError::RunNotFound(run_id)) => {
                let reason = format!("run '{run_id}' does not exist");
                return Ok(self.reject(&ctx, reason).await);
            }
            Err(err) => return Err(err),
        };

        match begin {
            BeginOutcome::Started => {}
            BeginOutcome::AlreadyTerminal(status) => {
                let rechained = if status == StageStatus::Succeeded {
                    let lost = self
                        .runtime
                        .runs
                        .undispatched_dependents(&ctx.run_id, &ctx.stage)
                        .await?;
                    self.chain(&ctx, &lost).await?;
                    lost
                } else {
                    Vec::new()
                };
                let record = ctx
                    .record(Outcome::Duplicate)
                    .with_reason(format!("stage already {status}"));
                self.runtime.monitor.record(record).await;
                return Ok(Invocation::Duplicate { status, rechained });
            }
            BeginOutcome::InProgress { attempt } => {
                let record = ctx
                    .record(Outcome::Duplicate)
                    .with_reason(format!("stage is running (attempt {attempt})"));
                self.runtime.monitor.record(record).await;
                return Ok(Invocation::Duplicate {
                    status: StageStatus::Running,
                    rechained: Vec::new(),
                });
            }
            BeginOutcome::RunFinished(status) => {
                return Ok(self.skip(&ctx, format!("run already {status}")).await);
            }
            BeginOutcome::DependenciesPending(pending) => {
                let reason = format!("waiting on {}", pending.join(", "));
                return Ok(self.skip(&ctx, reason).await);
            }
            BeginOutcome::NotInPlan => {
                let reason = format!("stage '{}' is not part of run '{}'", ctx.stage, ctx.run_id);
                return Ok(self.reject(&ctx, reason).await);
            }
        }

        debug!(
            run_id = %ctx.run_id,
            stage = %ctx.stage,
            layer = %stage.layer,
            attempt = ctx.attempt,
            "Stage started"
        );

        match self.execute_stage(&ctx, &stage).await {
            Ok(output) => self.succeed(&ctx, output).await,
            Err(err) if err.is_transient() => {
                if let Err(release_err) = self
                    .runtime
                    .runs
                    .release_stage(&ctx.run_id, &ctx.stage)
                    .await
                {
                    warn!(
                        run_id = %ctx.run_id,
                        stage = %ctx.stage,
                        error = %release_err,
                        "Could not release stage after transient failure"
                    );
                }
                Err(err)
            }
            Err(err) => self.fail(&ctx, &err).await,
        }
    }

    /// Records a transient failure that will be redelivered.
    pub async fn retrying(&self, message: &QueueMessage, err: &MedallionError) {
        let ctx = RunContext::new(Arc::clone(&self.runtime), message);
        let record = ctx
            .record(Outcome::Retrying)
            .with_error(err.kind(), err.to_string());
        self.runtime.monitor.record(record).await;
    }

    /// Gives up on a message whose attempts are exhausted.
    ///
    /// A stage that never finished is marked failed. A stage that succeeded
    /// but could not chain fails its first stranded dependent instead. Either
    /// way the run fails, and the dead-letter alert is raised.
    pub async fn abandon(&self, message: &QueueMessage, reason: &str) -> Result<(), MedallionError> {
        let ctx = RunContext::new(Arc::clone(&self.runtime), message);
        let runs = &self.runtime.runs;
        let failure = format!("dead-lettered after {} attempts: {reason}", ctx.attempt);

        let status = runs
            .get(&ctx.run_id)
            .await?
            .and_then(|run| run.stage_status(&ctx.stage));
        match status {
            Some(StageStatus::Succeeded) => {
                let stranded = runs.undispatched_dependents(&ctx.run_id, &ctx.stage).await?;
                if let Some(dependent) = stranded.first() {
                    let failure = format!("stage '{dependent}' was never enqueued: {failure}");
                    self.fail_run_at(&ctx.run_id, dependent, failure).await?;
                }
            }
            Some(status) if !status.is_terminal() => {
                self.fail_run_at(&ctx.run_id, &ctx.stage, failure).await?;
            }
            _ => {}
        }

        let record = ctx
            .record(Outcome::DeadLettered)
            .with_error("dead_lettered", reason);
        self.runtime.monitor.record(record).await;
        self.runtime
            .monitor
            .dead_lettered(&ctx.run_id, &ctx.stage, ctx.attempt, reason)
            .await;
        Ok(())
    }

    async fn fail_run_at(
        &self,
        run_id: &str,
        stage: &str,
        failure: String,
    ) -> Result<(), MedallionError> {
        let outcome = self.runtime.runs.fail_stage(run_id, stage, &failure).await?;
        if outcome.run_finished {
            self.runtime
                .monitor
                .run_finished(run_id, RunStatus::Failed, Some(failure))
                .await;
        }
        Ok(())
    }

    async fn succeed(
        &self,
        ctx: &RunContext,
        output: DatasetRef,
    ) -> Result<Invocation, MedallionError> {
        let outcome = self
            .runtime
            .runs
            .complete_stage(&ctx.run_id, &ctx.stage, Some(output.clone()))
            .await?;

        let record = ctx.record(Outcome::Succeeded).with_output(output.as_str());
        self.runtime.monitor.record(record).await;

        self.chain(ctx, &outcome.ready).await?;
        if outcome.run_finished {
            self.runtime
                .monitor
                .run_finished(&ctx.run_id, outcome.run_status, None)
                .await;
        }

        Ok(Invocation::Succeeded {
            output,
            chained: outcome.ready,
        })
    }

    async fn fail(
        &self,
        ctx: &RunContext,
        err: &MedallionError,
    ) -> Result<Invocation, MedallionError> {
        let reason = err.to_string();
        let outcome = self
            .runtime
            .runs
            .fail_stage(&ctx.run_id, &ctx.stage, &reason)
            .await?;

        let record = ctx.record(Outcome::Failed).with_error(err.kind(), &reason);
        self.runtime.monitor.record(record).await;
        if !outcome.skipped.is_empty() {
            debug!(
                run_id = %ctx.run_id,
                skipped = ?outcome.skipped,
                "Pending stages skipped"
            );
        }
        if outcome.run_finished {
            self.runtime
                .monitor
                .run_finished(&ctx.run_id, RunStatus::Failed, Some(reason.clone()))
                .await;
        }
        Ok(Invocation::Failed { reason })
    }

    async fn skip(&self, ctx: &RunContext, reason: String) -> Invocation {
        let record = ctx.record(Outcome::Skipped).with_reason(&reason);
        self.runtime.monitor.record(record).await;
        Invocation::Skipped { reason }
    }

    async fn reject(&self, ctx: &RunContext, reason: String) -> Invocation {
        let record = ctx.record(Outcome::Rejected).with_reason(&reason);
        self.runtime.monitor.record(record).await;
        Invocation::Rejected { reason }
    }

    /// Enqueues one message per stage and marks each dispatched.
    async fn chain(&self, ctx: &RunContext, stages: &[String]) -> Result<(), MedallionError> {
        for next in stages {
            self.runtime.queue.send(ctx.chained(next)).await?;
            self.runtime.runs.mark_dispatched(&ctx.run_id, next).await?;
            debug!(run_id = %ctx.run_id, from = %ctx.stage, to = %next, "Chained stage");
        }
        Ok(())
    }

    /// Runs the layer policy; a staged output is discarded on any error.
    async fn execute_stage(
        &self,
        ctx: &RunContext,
        stage: &Arc<StageDefinition>,
    ) -> Result<DatasetRef, MedallionError> {
        let inputs = self.resolve_inputs(ctx, stage).await?;
        let outputs = &self.runtime.outputs;
        let staging = outputs
            .staging_location(&ctx.run_id, stage, ctx.attempt)
            .await?;
        let stage_ctx = StageContext::new(&ctx.run_id, Arc::clone(stage), ctx.attempt, staging)
            .with_inputs(inputs);

        let result = match stage.layer {
            Layer::Bronze => self.run_bronze(stage_ctx.clone()).await,
            Layer::Silver => self.run_silver(&stage_ctx).await,
            Layer::Gold => self.run_gold(&stage_ctx).await,
        };

        if result.is_err() {
            if let Err(err) = outputs.discard(&stage_ctx.staging).await {
                warn!(
                    run_id = %ctx.run_id,
                    stage = %ctx.stage,
                    error = %err,
                    "Could not discard staged output"
                );
            }
        }
        result
    }

    /// Upstream outputs keyed by dependency name.
    ///
    /// Dependencies in the run's plan resolve to what this run committed
    /// for them. Dependencies outside the plan resolve to the latest output
    /// any run committed.
    async fn resolve_inputs(
        &self,
        ctx: &RunContext,
        stage: &StageDefinition,
    ) -> Result<BTreeMap<String, DatasetRef>, MedallionError> {
        let run = self
            .runtime
            .runs
            .get(&ctx.run_id)
            .await?
            .ok_or_else(|| MedallionError::RunNotFound(ctx.run_id.clone()))?;

        let mut inputs = BTreeMap::new();
        for dep in &stage.depends_on {
            let output = match run.stages.get(dep) {
                Some(state) => state.output.clone(),
                None => match self.runtime.graph.stage(dep) {
                    Some(def) => self.runtime.outputs.committed(def).await?,
                    None => None,
                },
            };
            if let Some(output) = output {
                inputs.insert(dep.clone(), output);
            }
        }
        Ok(inputs)
    }

    fn unit_for(&self, stage: &StageDefinition) -> Result<Arc<dyn UnitOfWork>, MedallionError> {
        self.runtime.registry.unit(&stage.unit).ok_or_else(|| {
            ConfigurationError::invalid(
                "CONFIG-UNKNOWN-UNIT",
                format!("unit '{}' of stage '{}' is not registered", stage.unit, stage.name),
            )
            .into()
        })
    }

    /// Extract newer rows, commit, then advance the checkpoint.
    async fn run_bronze(&self, ctx: StageContext) -> Result<DatasetRef, MedallionError> {
        let stage = Arc::clone(&ctx.stage);
        let source = stage.source_id();
        let since = self.runtime.checkpoints.get(source).await?;
        let ctx = ctx.with_since(since.clone());

        let work = self.unit_for(&stage)?.run(&ctx).await?;
        let output = self
            .runtime
            .outputs
            .commit(&ctx.run_id, &stage, &ctx.staging)
            .await?;

        // The checkpoint moves only after the output is committed.
        if let Some(observed) = &work.max_watermark {
            let next = Watermark::advance(since.as_ref(), observed)?;
            if since.as_ref() != Some(&next) {
                let applied = self
                    .runtime
                    .checkpoints
                    .compare_and_set(source, since.as_ref(), &next)
                    .await?;
                if !applied {
                    return Err(CheckpointConflictError {
                        source_id: source.to_string(),
                        expected: since,
                        attempted: next,
                    }
                    .into());
                }
                info!(
                    run_id = %ctx.run_id,
                    stage = %stage.name,
                    source = %source,
                    watermark = %next,
                    rows = work.rows,
                    "Checkpoint advanced"
                );
            }
        }
        Ok(output)
    }

    /// Materialise, gate, deduplicate, then commit.
    async fn run_silver(&self, ctx: &StageContext) -> Result<DatasetRef, MedallionError> {
        let stage = &ctx.stage;
        self.unit_for(stage)?.run(ctx).await?;

        let mut results = Vec::new();
        for key in &stage.quality_checks {
            let check = self.runtime.registry.check(key).ok_or_else(|| {
                ConfigurationError::invalid(
                    "CONFIG-UNKNOWN-UNIT",
                    format!("check '{key}' of stage '{}' is not registered", stage.name),
                )
            })?;
            results.extend(check.evaluate(ctx, &ctx.staging).await?);
        }

        let verdict = GateVerdict::new(results);
        if !verdict.results().is_empty() {
            self.runtime
                .monitor
                .quality(&ctx.run_id, &stage.name, verdict.results().to_vec())
                .await;
        }
        if !verdict.passed() {
            return Err(QualityGateError {
                stage: stage.name.clone(),
                failures: verdict.blocking(),
            }
            .into());
        }

        if let Some(dedup) = &stage.dedup {
            let deduplicator = self
                .runtime
                .registry
                .deduplicator(&dedup.method)
                .ok_or_else(|| {
                    ConfigurationError::invalid(
                        "CONFIG-UNKNOWN-UNIT",
                        format!(
                            "deduplicator '{}' of stage '{}' is not registered",
                            dedup.method, stage.name
                        ),
                    )
                })?;
            deduplicator
                .deduplicate(ctx, &ctx.staging, &dedup.settings)
                .await?;
        }

        self.runtime
            .outputs
            .commit(&ctx.run_id, stage, &ctx.staging)
            .await
    }

    /// Compose upstream outputs and commit.
    async fn run_gold(&self, ctx: &StageContext) -> Result<DatasetRef, MedallionError> {
        self.unit_for(&ctx.stage)?.run(ctx).await?;
        self.runtime
            .outputs
            .commit(&ctx.run_id, &ctx.stage, &ctx.staging)
            .await
    }
}
