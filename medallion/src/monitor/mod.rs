//! Observational audit trail.
//!
//! The [`Monitor`] counts outcomes, emits the human-readable log lines that
//! external alerting watches for, and forwards [`MonitorEvent`]s to a
//! [`RecordSink`]. It never returns an error to the executor.

mod buffered;
mod counters;
mod event;
mod sink;

pub use buffered::{BufferMetrics, BufferedSink};
pub use counters::{CountersSnapshot, OutcomeCounters};
pub use event::MonitorEvent;
pub use sink::{
    CollectingSink, FanoutSink, JsonLinesSink, LoggingSink, MetricsFileSink, NoOpSink, RecordSink,
};

use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::MonitoringSettings;
use crate::core::{ExecutionRecord, Outcome, QualityGateResult, RunStatus};

/// Counts outcomes and writes audit events, best effort.
#[derive(Clone)]
pub struct Monitor {
    counters: Arc<OutcomeCounters>,
    sink: Arc<dyn RecordSink>,
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("counters", &self.counters.snapshot())
            .finish_non_exhaustive()
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new(Arc::new(NoOpSink))
    }
}

impl Monitor {
    /// Creates a monitor writing straight to `sink`.
    #[must_use]
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self {
            counters: Arc::new(OutcomeCounters::new()),
            sink,
        }
    }

    /// Builds the monitor described by `settings`.
    ///
    /// Events go through a [`BufferedSink`] to a JSON-lines log and a
    /// metrics document when their paths are set, and to debug logging
    /// otherwise. Must be called inside a tokio runtime.
    #[must_use]
    pub fn from_settings(settings: &MonitoringSettings) -> Self {
        let counters = Arc::new(OutcomeCounters::new());
        let mut fanout = FanoutSink::default();
        if let Some(path) = &settings.log_path {
            fanout.push(Arc::new(JsonLinesSink::new(path)));
        }
        if let Some(path) = &settings.metrics_path {
            fanout.push(Arc::new(MetricsFileSink::new(path, Arc::clone(&counters))));
        }
        if fanout.is_empty() {
            fanout.push(Arc::new(LoggingSink));
        }

        Self {
            counters,
            sink: Arc::new(BufferedSink::spawn(Arc::new(fanout), settings.buffer_size)),
        }
    }

    /// The live counters.
    #[must_use]
    pub fn counters(&self) -> &OutcomeCounters {
        &self.counters
    }

    /// Records one executor invocation.
    pub async fn record(&self, record: ExecutionRecord) {
        self.counters.record(record.outcome);
        let reason = record.error.as_deref().unwrap_or("no reason given");
        match record.outcome {
            Outcome::Succeeded => info!(
                run_id = %record.run_id,
                stage = %record.stage,
                attempt = record.attempt,
                duration_ms = record.duration_ms(),
                "Stage {} completed", record.stage
            ),
            Outcome::Failed | Outcome::DeadLettered => info!(
                run_id = %record.run_id,
                stage = %record.stage,
                attempt = record.attempt,
                outcome = %record.outcome,
                "Stage {} failed: {}", record.stage, reason
            ),
            Outcome::Skipped | Outcome::Duplicate | Outcome::Rejected => info!(
                run_id = %record.run_id,
                stage = %record.stage,
                attempt = record.attempt,
                outcome = %record.outcome,
                "Stage {} skipped: {}", record.stage, reason
            ),
            Outcome::Retrying => warn!(
                run_id = %record.run_id,
                stage = %record.stage,
                attempt = record.attempt,
                "Stage {} will be retried: {}", record.stage, reason
            ),
        }
        self.emit(MonitorEvent::Execution(record)).await;
    }

    /// Records the quality results of a silver stage.
    pub async fn quality(&self, run_id: &str, stage: &str, results: Vec<QualityGateResult>) {
        for warning in results.iter().filter(|r| r.is_warning()) {
            warn!(
                run_id = %run_id,
                stage = %stage,
                check = %warning.check,
                "Quality warning: {}", warning.message
            );
        }
        self.emit(MonitorEvent::Quality {
            run_id: run_id.to_string(),
            stage: stage.to_string(),
            results,
        })
        .await;
    }

    /// Records a run reaching a terminal status.
    pub async fn run_finished(&self, run_id: &str, status: RunStatus, reason: Option<String>) {
        self.counters.record_run(status);
        match (&status, &reason) {
            (RunStatus::Failed, Some(reason)) => {
                info!(run_id = %run_id, "Run {} failed: {}", run_id, reason);
            }
            _ => info!(run_id = %run_id, "Run {} {}", run_id, status),
        }
        self.emit(MonitorEvent::RunFinished {
            run_id: run_id.to_string(),
            status,
            reason,
            at: Utc::now(),
        })
        .await;
    }

    /// Raises the alert for a dead-lettered message.
    pub async fn dead_lettered(&self, run_id: &str, stage: &str, attempt: u32, reason: &str) {
        error!(
            run_id = %run_id,
            stage = %stage,
            attempt,
            alert = true,
            "Message for stage {} dead-lettered: {}", stage, reason
        );
        self.emit(MonitorEvent::DeadLettered {
            run_id: run_id.to_string(),
            stage: stage.to_string(),
            attempt,
            reason: reason.to_string(),
            at: Utc::now(),
        })
        .await;
    }

    /// Waits for buffered events to reach the sink.
    pub async fn flush(&self) {
        if let Err(err) = self.sink.flush().await {
            warn!(error = %err, "Monitor flush failed");
        }
    }

    async fn emit(&self, event: MonitorEvent) {
        if let Err(err) = self.sink.write(&event).await {
            warn!(run_id = %event.run_id(), error = %err, "Monitor write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Severity;
    use crate::errors::MedallionError;
    use async_trait::async_trait;

    #[tokio::test]
    async fn test_record_counts_and_forwards() {
        let sink = Arc::new(CollectingSink::new());
        let monitor = Monitor::new(sink.clone());

        monitor
            .record(ExecutionRecord::new("r1", "bronze", 1, Utc::now(), Outcome::Succeeded))
            .await;
        monitor
            .record(
                ExecutionRecord::new("r1", "silver", 1, Utc::now(), Outcome::Failed)
                    .with_error("quality_gate", "no_duplicates"),
            )
            .await;
        monitor
            .run_finished("r1", RunStatus::Failed, Some("no_duplicates".into()))
            .await;

        assert_eq!(monitor.counters().get(Outcome::Succeeded), 1);
        assert_eq!(monitor.counters().get(Outcome::Failed), 1);
        assert_eq!(monitor.counters().snapshot().runs_failed, 1);
        assert_eq!(sink.len(), 3);
    }

    #[tokio::test]
    async fn test_sink_failure_is_not_fatal() {
        struct Down;
        #[async_trait]
        impl RecordSink for Down {
            async fn write(&self, _event: &MonitorEvent) -> Result<(), MedallionError> {
                Err(MedallionError::Internal("unavailable".into()))
            }
        }

        let monitor = Monitor::new(Arc::new(Down));
        monitor
            .record(ExecutionRecord::new("r1", "gold", 1, Utc::now(), Outcome::Succeeded))
            .await;
        monitor
            .quality(
                "r1",
                "silver",
                vec![QualityGateResult::new("freshness", false, Severity::Warning, "stale")],
            )
            .await;

        assert_eq!(monitor.counters().get(Outcome::Succeeded), 1);
    }

    #[tokio::test]
    async fn test_from_settings_writes_log_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = MonitoringSettings {
            log_path: Some(dir.path().join("records.jsonl")),
            metrics_path: Some(dir.path().join("metrics.json")),
            buffer_size: 8,
        };
        let monitor = Monitor::from_settings(&settings);

        monitor
            .record(ExecutionRecord::new("r1", "bronze", 1, Utc::now(), Outcome::Succeeded))
            .await;
        monitor.flush().await;

        let log = tokio::fs::read_to_string(dir.path().join("records.jsonl"))
            .await
            .unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(dir.path().join("metrics.json").exists());
    }
}
