//! Bounded worker pool pulling invocations off the queue.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Executor, Invocation, ShutdownSignal};
use crate::errors::MedallionError;
use crate::queue::{Delivery, InFlightGuard};

/// What a worker did with one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    /// The executor handled the message and it was acknowledged.
    Handled(Invocation),
    /// Another worker holds the same `(run, stage)`; the message was deferred.
    Deferred,
    /// A transient failure; the message was released for redelivery.
    Retried,
    /// Attempts were exhausted; the message was dead-lettered.
    DeadLettered,
}

/// A pool of workers, each handling one invocation at a time.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    executor: Arc<Executor>,
    guard: InFlightGuard,
    shutdown: ShutdownSignal,
}

impl WorkerPool {
    /// Creates a pool around `executor`.
    #[must_use]
    pub fn new(executor: Arc<Executor>) -> Self {
        Self {
            executor,
            guard: InFlightGuard::new(),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Uses an externally owned shutdown signal.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// The signal that stops the workers.
    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// The executor.
    #[must_use]
    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Spawns `settings.concurrency` workers.
    #[must_use]
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let workers = self.executor.runtime().settings.concurrency.max(1);
        (0..workers)
            .map(|id| {
                let pool = self.clone();
                tokio::spawn(async move { pool.worker_loop(id).await })
            })
            .collect()
    }

    /// Runs the workers until shutdown is triggered.
    pub async fn run(&self) {
        for handle in self.spawn() {
            if let Err(err) = handle.await {
                warn!(error = %err, "Worker task ended abnormally");
            }
        }
    }

    /// Receives and processes at most one delivery.
    ///
    /// Returns `None` if nothing arrived within `wait`.
    pub async fn process_next(&self, wait: Duration) -> Result<Option<Processed>, MedallionError> {
        match self.executor.runtime().queue.receive(wait).await? {
            Some(delivery) => Ok(Some(self.process(delivery).await)),
            None => Ok(None),
        }
    }

    async fn worker_loop(&self, id: usize) {
        let runtime = Arc::clone(self.executor.runtime());
        let wait = runtime.settings.receive_wait;
        debug!(worker = id, "Worker started");

        while !self.shutdown.is_triggered() {
            let received = tokio::select! {
                () = self.shutdown.wait() => break,
                received = runtime.queue.receive(wait) => received,
            };
            match received {
                Ok(Some(delivery)) => {
                    self.process(delivery).await;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(worker = id, error = %err, "Queue receive failed");
                    tokio::time::sleep(wait).await;
                }
            }
        }
        debug!(worker = id, "Worker stopped");
    }

    async fn process(&self, delivery: Delivery) -> Processed {
        let runtime = Arc::clone(self.executor.runtime());
        let message = &delivery.message;

        let Some(_lease) = self.guard.try_acquire(&message.run_id, &message.stage) else {
            debug!(
                run_id = %message.run_id,
                stage = %message.stage,
                "Stage already in flight, deferring"
            );
            if let Err(err) = runtime
                .queue
                .defer(&delivery, runtime.settings.defer_delay)
                .await
            {
                warn!(error = %err, "Could not defer message");
            }
            return Processed::Deferred;
        };

        match self.executor.handle(message).await {
            Ok(invocation) => {
                if let Err(err) = runtime.queue.ack(&delivery).await {
                    warn!(run_id = %message.run_id, stage = %message.stage, error = %err, "Ack failed");
                }
                Processed::Handled(invocation)
            }
            Err(err) if err.is_transient() && message.attempt < runtime.settings.max_attempts => {
                self.executor.retrying(message, &err).await;
                let delay = runtime.settings.retry.delay_for(message.attempt);
                if let Err(release_err) = runtime.queue.release(&delivery, delay).await {
                    warn!(error = %release_err, "Could not release message");
                }
                Processed::Retried
            }
            Err(err) => {
                let reason = err.to_string();
                info!(
                    run_id = %message.run_id,
                    stage = %message.stage,
                    attempt = message.attempt,
                    "Giving up on message"
                );
                if let Err(dl_err) = runtime.queue.dead_letter(&delivery, &reason).await {
                    warn!(error = %dl_err, "Could not dead-letter message");
                }
                if let Err(abandon_err) = self.executor.abandon(message, &reason).await {
                    warn!(error = %abandon_err, "Could not mark abandoned stage failed");
                }
                Processed::DeadLettered
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Outcome, RunStatus, StageStatus};
    use crate::monitor::MonitorEvent;
    use crate::stages::{MemoryOutputStore, Registry};
    use crate::executor::ExecutorSettings;
    use crate::queue::{QueueChannel, QueueMessage};
    use crate::testing::{
        fast_settings, three_layer_graph, FlakyUnit, PassthroughTransform, StaticCheck,
        StaticRowsExtraction, TestHarness,
    };
    use pretty_assertions::assert_eq;

    fn always_failing_bronze() -> TestHarness {
        let outputs = MemoryOutputStore::new();
        let registry = Registry::new();
        let extraction = Arc::new(StaticRowsExtraction::new(outputs.clone(), "id", vec![]));
        registry.register_unit("bronze", Arc::new(FlakyUnit::always(extraction)));
        TestHarness::builder(three_layer_graph())
            .registry(registry)
            .outputs(outputs)
            .build()
    }

    #[tokio::test]
    async fn test_exhausted_attempts_dead_letter() {
        let h = always_failing_bronze();
        let run_id = h.driver.start("all").await.unwrap();

        let processed = h.drain().await;

        assert_eq!(
            processed,
            vec![Processed::Retried, Processed::Retried, Processed::DeadLettered]
        );
        let dead = h.queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.attempt, 3);

        let run = h.run_state(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stage_status("bronze"), Some(StageStatus::Failed));
        assert_eq!(run.stage_status("silver"), Some(StageStatus::Skipped));

        assert!(h
            .sink
            .events()
            .iter()
            .any(|e| matches!(e, MonitorEvent::DeadLettered { stage, .. } if stage == "bronze")));
        assert_eq!(h.runtime.monitor.counters().get(Outcome::Retrying), 2);
    }

    fn bounded_harness(capacity: usize, max_attempts: u32) -> TestHarness {
        let outputs = MemoryOutputStore::new();
        let registry = Registry::new();
        let extraction = StaticRowsExtraction::new(outputs.clone(), "id", vec![]);
        registry.register_unit("bronze", Arc::new(extraction));
        registry.register_unit("silver", Arc::new(PassthroughTransform::new(outputs.clone())));
        registry.register_unit("gold", Arc::new(PassthroughTransform::new(outputs.clone())));
        registry.register_check("no_duplicates", Arc::new(StaticCheck::passing("no_duplicates")));
        TestHarness::builder(three_layer_graph())
            .registry(registry)
            .outputs(outputs)
            .queue_capacity(capacity)
            .settings(ExecutorSettings {
                max_attempts,
                ..fast_settings()
            })
            .build()
    }

    /// Receives the run's first message, then fills the queue so that
    /// chaining from it is refused.
    async fn receive_with_full_queue(h: &TestHarness) -> (String, Delivery) {
        let run_id = h.driver.start("all").await.unwrap();
        let delivery = h.queue.receive(Duration::ZERO).await.unwrap().unwrap();
        h.queue.send(QueueMessage::new("other-run", "bronze")).await.unwrap();
        (run_id, delivery)
    }

    #[tokio::test]
    async fn test_chain_failure_on_last_attempt_fails_run() {
        let h = bounded_harness(1, 1);
        let (run_id, delivery) = receive_with_full_queue(&h).await;

        let processed = h.pool.process(delivery).await;

        assert_eq!(processed, Processed::DeadLettered);
        let run = h.run_state(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stage_status("bronze"), Some(StageStatus::Succeeded));
        assert_eq!(run.stage_status("silver"), Some(StageStatus::Failed));
        assert_eq!(run.stage_status("gold"), Some(StageStatus::Skipped));
        let failure = run.failure.unwrap();
        assert_eq!(failure.stage, "silver");
        assert!(failure.reason.contains("queue is full"));
        assert_eq!(h.queue.dead_letters().len(), 1);
        assert_eq!(h.runtime.monitor.counters().snapshot().runs_failed, 1);
    }

    #[tokio::test]
    async fn test_chain_failure_with_attempts_left_rechains() {
        let h = bounded_harness(1, 3);
        let (run_id, delivery) = receive_with_full_queue(&h).await;

        assert_eq!(h.pool.process(delivery).await, Processed::Retried);
        h.drain().await;

        let run = h.run_state(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(h.queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_stage_is_deferred() {
        let h = always_failing_bronze();
        let run_id = h.driver.start("all").await.unwrap();
        let _lease = h.pool.guard.try_acquire(&run_id, "bronze").unwrap();

        let processed = h.pool.process_next(Duration::from_millis(50)).await.unwrap();

        assert_eq!(processed, Some(Processed::Deferred));
        let pending = h.queue.pending_messages();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_spawned_workers_stop_on_shutdown() {
        let h = always_failing_bronze();
        let handles = h.pool.spawn();
        assert_eq!(handles.len(), 2);

        h.pool.shutdown_signal().trigger("test");
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
