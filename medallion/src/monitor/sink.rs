//! Record sink trait and implementations.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{MonitorEvent, OutcomeCounters};
use crate::core::Outcome;
use crate::errors::MedallionError;

/// Destination for audit events.
///
/// Write failures are reported to the caller, which logs and drops them;
/// a sink never influences control flow.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Writes one event.
    async fn write(&self, event: &MonitorEvent) -> Result<(), MedallionError>;

    /// Waits until previously written events reached their destination.
    async fn flush(&self) -> Result<(), MedallionError> {
        Ok(())
    }
}

/// A sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSink;

#[async_trait]
impl RecordSink for NoOpSink {
    async fn write(&self, _event: &MonitorEvent) -> Result<(), MedallionError> {
        Ok(())
    }
}

/// A sink that logs every event at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

#[async_trait]
impl RecordSink for LoggingSink {
    async fn write(&self, event: &MonitorEvent) -> Result<(), MedallionError> {
        debug!(run_id = %event.run_id(), event = ?event, "Audit event");
        Ok(())
    }
}

/// A sink that keeps events in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: RwLock<Vec<MonitorEvent>>,
}

impl CollectingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event written so far.
    #[must_use]
    pub fn events(&self) -> Vec<MonitorEvent> {
        self.events.read().clone()
    }

    /// Execution records for `run_id`, in write order.
    #[must_use]
    pub fn records_for(&self, run_id: &str) -> Vec<crate::core::ExecutionRecord> {
        self.events
            .read()
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::Execution(r) if r.run_id == run_id => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

#[async_trait]
impl RecordSink for CollectingSink {
    async fn write(&self, event: &MonitorEvent) -> Result<(), MedallionError> {
        self.events.write().push(event.clone());
        Ok(())
    }
}

/// Appends each event as one JSON line.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesSink {
    /// Creates a sink appending to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// The file being appended to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for JsonLinesSink {
    async fn write(&self, event: &MonitorEvent) -> Result<(), MedallionError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Rewrites a JSON metrics document after every event.
///
/// The document holds the shared outcome counters plus the last committed
/// output of each stage.
#[derive(Debug)]
pub struct MetricsFileSink {
    path: PathBuf,
    counters: Arc<OutcomeCounters>,
    outputs: Mutex<BTreeMap<String, String>>,
}

impl MetricsFileSink {
    /// Creates a sink writing to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, counters: Arc<OutcomeCounters>) -> Self {
        Self {
            path: path.into(),
            counters,
            outputs: Mutex::new(BTreeMap::new()),
        }
    }
}

#[async_trait]
impl RecordSink for MetricsFileSink {
    async fn write(&self, event: &MonitorEvent) -> Result<(), MedallionError> {
        let mut outputs = self.outputs.lock().await;
        if let MonitorEvent::Execution(record) = event {
            if let (Outcome::Succeeded, Some(output)) = (record.outcome, &record.output) {
                outputs.insert(record.stage.clone(), output.clone());
            }
        }

        let document = serde_json::json!({
            "counters": self.counters.snapshot(),
            "outputs": &*outputs,
            "updated_at": chrono::Utc::now(),
        });
        let body = serde_json::to_vec_pretty(&document)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Writes every event to each inner sink.
///
/// A failing sink does not stop the others; the first error is returned.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn RecordSink>>,
}

impl FanoutSink {
    /// Creates a fan-out over `sinks`.
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn RecordSink>>) -> Self {
        Self { sinks }
    }

    /// Adds a sink.
    pub fn push(&mut self, sink: Arc<dyn RecordSink>) {
        self.sinks.push(sink);
    }

    /// Number of inner sinks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Returns true if there is no inner sink.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl RecordSink for FanoutSink {
    async fn write(&self, event: &MonitorEvent) -> Result<(), MedallionError> {
        let results = join_all(self.sinks.iter().map(|sink| sink.write(event))).await;
        let mut first_error = None;
        for err in results.into_iter().filter_map(Result::err) {
            warn!(error = %err, "Record sink write failed");
            first_error.get_or_insert(err);
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn flush(&self) -> Result<(), MedallionError> {
        join_all(self.sinks.iter().map(|sink| sink.flush()))
            .await
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ExecutionRecord;
    use chrono::Utc;
    use tempfile::TempDir;

    fn execution(stage: &str, outcome: Outcome) -> MonitorEvent {
        let mut record = ExecutionRecord::new("r1", stage, 1, Utc::now(), outcome);
        if outcome == Outcome::Succeeded {
            record = record.with_output(format!("mem://{stage}"));
        }
        MonitorEvent::Execution(record)
    }

    #[tokio::test]
    async fn test_collecting_sink_filters_by_run() {
        let sink = CollectingSink::new();
        sink.write(&execution("bronze", Outcome::Succeeded)).await.unwrap();
        sink.write(&MonitorEvent::Quality {
            run_id: "r1".into(),
            stage: "silver".into(),
            results: vec![],
        })
        .await
        .unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.records_for("r1").len(), 1);
        assert!(sink.records_for("r2").is_empty());
    }

    #[tokio::test]
    async fn test_json_lines_appends() {
        let dir = TempDir::new().unwrap();
        let sink = JsonLinesSink::new(dir.path().join("logs/records.jsonl"));

        sink.write(&execution("bronze", Outcome::Succeeded)).await.unwrap();
        sink.write(&execution("silver", Outcome::Failed)).await.unwrap();

        let body = tokio::fs::read_to_string(sink.path()).await.unwrap();
        let lines: Vec<serde_json::Value> = body
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["stage"], "silver");
        assert_eq!(lines[1]["outcome"], "failed");
    }

    #[tokio::test]
    async fn test_metrics_file_tracks_outputs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.json");
        let counters = Arc::new(OutcomeCounters::new());
        counters.record(Outcome::Succeeded);
        let sink = MetricsFileSink::new(&path, Arc::clone(&counters));

        sink.write(&execution("bronze", Outcome::Succeeded)).await.unwrap();

        let doc: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(doc["counters"]["outcomes"]["succeeded"], 1);
        assert_eq!(doc["outputs"]["bronze"], "mem://bronze");
    }

    #[tokio::test]
    async fn test_fanout_continues_after_failure() {
        struct Broken;
        #[async_trait]
        impl RecordSink for Broken {
            async fn write(&self, _event: &MonitorEvent) -> Result<(), MedallionError> {
                Err(MedallionError::Internal("disk full".into()))
            }
        }

        let collecting = Arc::new(CollectingSink::new());
        let fanout = FanoutSink::new(vec![Arc::new(Broken), collecting.clone()]);

        let err = fanout.write(&execution("gold", Outcome::Succeeded)).await;
        assert!(err.is_err());
        assert_eq!(collecting.len(), 1);
    }
}
