//! Bounded, non-blocking buffering in front of a slow sink.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use super::{MonitorEvent, RecordSink};
use crate::errors::MedallionError;

/// Counters describing how the buffer is coping.
#[derive(Debug, Default)]
pub struct BufferMetrics {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl BufferMetrics {
    /// Events handed to the downstream sink.
    #[must_use]
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Events dropped because the buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events the downstream sink failed to write.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Drop rate as a percentage of all accepted and dropped events.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn drop_rate(&self) -> f64 {
        let dropped = self.dropped();
        let total = self.forwarded() + self.failed() + dropped;
        if total == 0 {
            0.0
        } else {
            dropped as f64 / total as f64 * 100.0
        }
    }
}

enum Command {
    Write(MonitorEvent),
    Flush(oneshot::Sender<()>),
}

/// Queues events on a bounded channel drained by a background task.
///
/// `write` never waits: when the buffer is full the event is dropped and
/// counted. Must be created inside a tokio runtime.
pub struct BufferedSink {
    tx: mpsc::Sender<Command>,
    metrics: Arc<BufferMetrics>,
    capacity: usize,
}

impl BufferedSink {
    /// Spawns the drain task and returns the sink.
    #[must_use]
    pub fn spawn(downstream: Arc<dyn RecordSink>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, mut rx) = mpsc::channel::<Command>(capacity);
        let metrics = Arc::new(BufferMetrics::default());

        let task_metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Write(event) => match downstream.write(&event).await {
                        Ok(()) => {
                            task_metrics.forwarded.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            task_metrics.failed.fetch_add(1, Ordering::Relaxed);
                            warn!(run_id = %event.run_id(), error = %err, "Dropping audit event after sink failure");
                        }
                    },
                    Command::Flush(ack) => {
                        if let Err(err) = downstream.flush().await {
                            warn!(error = %err, "Record sink flush failed");
                        }
                        let _ = ack.send(());
                    }
                }
            }
        });

        Self {
            tx,
            metrics,
            capacity,
        }
    }

    /// Buffer counters.
    #[must_use]
    pub fn metrics(&self) -> &BufferMetrics {
        &self.metrics
    }

    /// Events waiting to be drained.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.capacity - self.tx.capacity()
    }
}

#[async_trait]
impl RecordSink for BufferedSink {
    async fn write(&self, event: &MonitorEvent) -> Result<(), MedallionError> {
        match self.tx.try_send(Command::Write(event.clone())) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    run_id = %event.run_id(),
                    dropped_total = self.metrics.dropped(),
                    "Audit event dropped, buffer full"
                );
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(MedallionError::Internal("audit buffer closed".into()))
            }
        }
    }

    async fn flush(&self) -> Result<(), MedallionError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack_tx))
            .await
            .map_err(|_| MedallionError::Internal("audit buffer closed".into()))?;
        ack_rx
            .await
            .map_err(|_| MedallionError::Internal("audit buffer closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExecutionRecord, Outcome};
    use crate::monitor::CollectingSink;
    use chrono::Utc;

    fn event(stage: &str) -> MonitorEvent {
        MonitorEvent::Execution(ExecutionRecord::new("r1", stage, 1, Utc::now(), Outcome::Succeeded))
    }

    #[test]
    fn test_metrics_default() {
        let metrics = BufferMetrics::default();
        assert_eq!(metrics.dropped(), 0);
        assert!(metrics.drop_rate().abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_flush_drains_to_downstream() {
        let downstream = Arc::new(CollectingSink::new());
        let sink = BufferedSink::spawn(downstream.clone(), 16);

        sink.write(&event("bronze")).await.unwrap();
        sink.write(&event("silver")).await.unwrap();
        sink.flush().await.unwrap();

        assert_eq!(downstream.len(), 2);
        assert_eq!(sink.metrics().forwarded(), 2);
        assert_eq!(sink.queued(), 0);
    }

    #[tokio::test]
    async fn test_full_buffer_drops_without_blocking() {
        struct Stuck;
        #[async_trait]
        impl RecordSink for Stuck {
            async fn write(&self, _event: &MonitorEvent) -> Result<(), MedallionError> {
                std::future::pending::<()>().await;
                Ok(())
            }
        }

        let sink = BufferedSink::spawn(Arc::new(Stuck), 1);
        for stage in ["a", "b", "c", "d"] {
            sink.write(&event(stage)).await.unwrap();
        }
        // One event is held by the drain task, one waits in the buffer.
        assert!(sink.metrics().dropped() >= 2);
    }
}
