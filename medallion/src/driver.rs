//! Run entry points: manual starts and the interval scheduler.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use uuid::Uuid;

use crate::core::RunStatus;
use crate::errors::{ConfigurationError, MedallionError};
use crate::executor::{Runtime, ShutdownSignal};
use crate::queue::QueueMessage;
use crate::runs::PipelineRun;

/// Turns "run the pipeline from X" into a run record and its first messages.
#[derive(Debug, Clone)]
pub struct Driver {
    runtime: Arc<Runtime>,
}

impl Driver {
    /// Creates a driver over `runtime`.
    #[must_use]
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }

    /// The stage order a run from `start` would execute. No side effects.
    ///
    /// # Errors
    ///
    /// Returns an error if `start` is neither `all` nor a defined stage.
    pub fn plan(&self, start: &str) -> Result<Vec<String>, ConfigurationError> {
        self.runtime.graph.topological_order(start)
    }

    /// Starts a run from `start` and returns its identifier.
    ///
    /// The run is stored with every planned stage `pending`, then one
    /// message is enqueued per plan root. Chaining discovers the rest.
    ///
    /// # Errors
    ///
    /// Configuration errors are returned before anything is stored or
    /// enqueued.
    pub async fn start(&self, start: &str) -> Result<String, MedallionError> {
        let graph = &self.runtime.graph;
        let order = self.plan(start)?;
        let dependencies = graph.plan_dependencies(&order);
        let run_id = Uuid::now_v7().to_string();

        let roots = graph.plan_roots(&order);
        let stages = order.len();
        let run = PipelineRun::new(&run_id, graph.name(), start, order, dependencies);
        self.runtime.runs.insert(run).await?;

        for root in &roots {
            let sent = self
                .runtime
                .queue
                .send(QueueMessage::new(&run_id, root))
                .await;
            if let Err(err) = sent {
                self.abort(&run_id, root, &err).await;
                return Err(err);
            }
            self.runtime.runs.mark_dispatched(&run_id, root).await?;
        }

        info!(
            run_id = %run_id,
            pipeline = %graph.name(),
            start_stage = %start,
            stages,
            roots = ?roots,
            "Run {} started", run_id
        );
        Ok(run_id)
    }

    /// Fails a run whose root never reached the queue. Pending stages are
    /// skipped and roots already enqueued are dropped on delivery.
    async fn abort(&self, run_id: &str, root: &str, err: &MedallionError) {
        let reason = format!("root stage '{root}' could not be enqueued: {err}");
        match self.runtime.runs.fail_stage(run_id, root, &reason).await {
            Ok(outcome) => {
                if outcome.run_finished {
                    self.runtime
                        .monitor
                        .run_finished(run_id, RunStatus::Failed, Some(reason))
                        .await;
                }
            }
            Err(fail_err) => error!(
                run_id = %run_id,
                stage = %root,
                error = %fail_err,
                "Could not fail run after enqueue error"
            ),
        }
    }
}

/// Starts a run on a fixed interval until shut down.
#[derive(Debug, Clone)]
pub struct Scheduler {
    driver: Driver,
    interval: Duration,
    start_stage: String,
}

impl Scheduler {
    /// Creates a scheduler starting runs from `start_stage` every `interval`.
    #[must_use]
    pub fn new(driver: Driver, interval: Duration, start_stage: impl Into<String>) -> Self {
        Self {
            driver,
            interval,
            start_stage: start_stage.into(),
        }
    }

    /// Ticks until `shutdown` is triggered; the first run starts immediately.
    ///
    /// A failed start is logged and the next tick tries again. Returns the
    /// ids of the runs that were started.
    pub async fn run(&self, shutdown: ShutdownSignal) -> Vec<String> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut started = Vec::new();

        loop {
            tokio::select! {
                () = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }
            match self.driver.start(&self.start_stage).await {
                Ok(run_id) => started.push(run_id),
                Err(err) => error!(
                    start_stage = %self.start_stage,
                    error = %err,
                    "Scheduled run could not start"
                ),
            }
        }
        info!(runs = started.len(), "Scheduler stopped");
        started
    }
}
