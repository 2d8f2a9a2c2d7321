//! At-least-once queue channel and its in-memory transport.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::QueueMessage;
use crate::errors::MedallionError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A message handed to a consumer, pending acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// The delivered message.
    pub message: QueueMessage,
    /// Transport handle used to ack, release or dead-letter this delivery.
    pub delivery_id: u64,
}

/// A message moved aside after exhausting its attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The message as last delivered.
    pub message: QueueMessage,
    /// Why it was dead-lettered.
    pub reason: String,
    /// When it was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
}

/// Protocol for queue transports.
///
/// Delivery is at-least-once: a received message that is neither acked nor
/// released within the visibility timeout becomes visible again with its
/// attempt count incremented.
#[async_trait]
pub trait QueueChannel: Send + Sync {
    /// Enqueues a message for immediate delivery.
    async fn send(&self, message: QueueMessage) -> Result<(), MedallionError>;

    /// Waits up to `wait` for a message.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, MedallionError>;

    /// Acknowledges a delivery, removing it permanently.
    async fn ack(&self, delivery: &Delivery) -> Result<(), MedallionError>;

    /// Returns a delivery for redelivery after `delay`, counting a new attempt.
    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<(), MedallionError>;

    /// Returns a delivery unprocessed after `delay`, keeping its attempt count.
    async fn defer(&self, delivery: &Delivery, delay: Duration) -> Result<(), MedallionError>;

    /// Moves a delivery to the dead-letter list.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), MedallionError>;
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<QueueMessage>,
    delayed: Vec<(Instant, QueueMessage)>,
    in_flight: HashMap<u64, (Instant, QueueMessage)>,
    dead: Vec<DeadLetter>,
    next_delivery: u64,
}

impl QueueState {
    fn pending(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    /// Moves due delayed messages and expired leases back to `ready`.
    fn promote(&mut self, now: Instant) {
        let mut due = Vec::new();
        self.delayed.retain(|(visible_at, message)| {
            if *visible_at <= now {
                due.push(message.clone());
                false
            } else {
                true
            }
        });
        self.ready.extend(due);

        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((_, mut message)) = self.in_flight.remove(&id) {
                tracing::warn!(
                    run_id = %message.run_id,
                    stage = %message.stage,
                    attempt = message.attempt,
                    "Visibility timeout expired, redelivering"
                );
                message.attempt += 1;
                self.ready.push_back(message);
            }
        }
    }

    fn take_in_flight(&mut self, delivery: &Delivery) -> Option<QueueMessage> {
        self.in_flight.remove(&delivery.delivery_id).map(|(_, m)| m)
    }
}

/// In-process queue with visibility timeouts, delayed delivery and a
/// dead-letter list.
#[derive(Debug, Clone)]
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    visibility_timeout: Duration,
    capacity: Option<usize>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), None)
    }
}

impl InMemoryQueue {
    /// Creates a queue. `capacity` bounds the number of undelivered messages.
    #[must_use]
    pub fn new(visibility_timeout: Duration, capacity: Option<usize>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            visibility_timeout,
            capacity,
        }
    }

    /// Number of messages waiting for delivery (ready or delayed).
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().pending()
    }

    /// Returns true if no message is waiting for delivery.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of deliveries awaiting acknowledgement.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Returns true if nothing is queued, delayed or in flight.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.pending() == 0 && state.in_flight.is_empty()
    }

    /// Messages that exhausted their attempts.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead.clone()
    }

    /// Snapshot of the messages waiting for delivery, in delivery order.
    #[must_use]
    pub fn pending_messages(&self) -> Vec<QueueMessage> {
        let state = self.state.lock();
        let mut delayed = state.delayed.clone();
        delayed.sort_by_key(|(at, _)| *at);
        state
            .ready
            .iter()
            .cloned()
            .chain(delayed.into_iter().map(|(_, m)| m))
            .collect()
    }

    fn check_capacity(&self, state: &QueueState) -> Result<(), MedallionError> {
        match self.capacity {
            Some(cap) if state.pending() >= cap => Err(MedallionError::Queue(format!(
                "queue is full ({cap} messages pending)"
            ))),
            _ => Ok(()),
        }
    }

    fn enqueue(&self, message: QueueMessage) -> Result<(), MedallionError> {
        {
            let mut state = self.state.lock();
            self.check_capacity(&state)?;
            state.ready.push_back(message);
        }
        self.notify.notify_one();
        Ok(())
    }

    fn requeue(&self, delivery: &Delivery, delay: Duration, bump_attempt: bool) {
        let requeued = {
            let mut state = self.state.lock();
            match state.take_in_flight(delivery) {
                Some(mut message) => {
                    if bump_attempt {
                        message.attempt += 1;
                    }
                    if delay.is_zero() {
                        state.ready.push_back(message);
                    } else {
                        state.delayed.push((Instant::now() + delay, message));
                    }
                    true
                }
                None => false,
            }
        };
        if requeued {
            self.notify.notify_one();
        } else {
            tracing::debug!(
                delivery_id = delivery.delivery_id,
                "Delivery already expired or settled"
            );
        }
    }

    fn try_receive(&self) -> Option<Delivery> {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.promote(now);
        let message = state.ready.pop_front()?;
        state.next_delivery += 1;
        let delivery_id = state.next_delivery;
        state
            .in_flight
            .insert(delivery_id, (now + self.visibility_timeout, message.clone()));
        Some(Delivery {
            message,
            delivery_id,
        })
    }
}

#[async_trait]
impl QueueChannel for InMemoryQueue {
    async fn send(&self, message: QueueMessage) -> Result<(), MedallionError> {
        self.enqueue(message)
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, MedallionError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_receive() {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let nap = (deadline - now).min(POLL_INTERVAL);
            let _ = tokio::time::timeout(nap, notified).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), MedallionError> {
        if self.state.lock().take_in_flight(delivery).is_none() {
            tracing::debug!(delivery_id = delivery.delivery_id, "Ack for unknown delivery");
        }
        Ok(())
    }

    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<(), MedallionError> {
        self.requeue(delivery, delay, true);
        Ok(())
    }

    async fn defer(&self, delivery: &Delivery, delay: Duration) -> Result<(), MedallionError> {
        self.requeue(delivery, delay, false);
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), MedallionError> {
        let mut state = self.state.lock();
        let message = state
            .take_in_flight(delivery)
            .unwrap_or_else(|| delivery.message.clone());
        state.dead.push(DeadLetter {
            message,
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_delivery_and_ack() {
        let queue = InMemoryQueue::default();
        queue.send(QueueMessage::new("r1", "bronze")).await.unwrap();
        queue.send(QueueMessage::new("r2", "bronze")).await.unwrap();

        let first = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.message.run_id, "r1");
        assert_eq!(queue.in_flight(), 1);

        queue.ack(&first).await.unwrap();
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_receive_times_out_when_empty() {
        let queue = InMemoryQueue::default();
        let got = queue.receive(Duration::from_millis(10)).await.unwrap();
        assert!(got.is_none());
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn test_release_increments_attempt() {
        let queue = InMemoryQueue::default();
        queue.send(QueueMessage::new("r1", "silver")).await.unwrap();

        let delivery = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        queue.release(&delivery, Duration::ZERO).await.unwrap();

        let again = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.message.attempt, 2);
        assert_ne!(again.delivery_id, delivery.delivery_id);
    }

    #[tokio::test]
    async fn test_defer_keeps_attempt() {
        let queue = InMemoryQueue::default();
        queue.send(QueueMessage::new("r1", "silver")).await.unwrap();

        let delivery = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        queue.defer(&delivery, Duration::ZERO).await.unwrap();

        let again = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.message.attempt, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_visibility_timeout_redelivers() {
        let queue = InMemoryQueue::new(Duration::from_secs(5), None);
        queue.send(QueueMessage::new("r1", "bronze")).await.unwrap();

        let _lost = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert!(queue.receive(Duration::ZERO).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        let redelivered = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(redelivered.message.attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_message_hidden_until_due() {
        let queue = InMemoryQueue::default();
        queue.send(QueueMessage::new("r1", "gold")).await.unwrap();
        let delivery = queue.receive(Duration::ZERO).await.unwrap().unwrap();
        queue.defer(&delivery, Duration::from_secs(2)).await.unwrap();

        assert!(queue.receive(Duration::ZERO).await.unwrap().is_none());
        let got = queue.receive(Duration::from_secs(3)).await.unwrap();
        assert_eq!(got.unwrap().message.stage, "gold");
    }

    #[tokio::test]
    async fn test_capacity_rejects_overflow() {
        let queue = InMemoryQueue::new(Duration::from_secs(300), Some(1));
        queue.send(QueueMessage::new("r1", "bronze")).await.unwrap();

        let err = queue.send(QueueMessage::new("r2", "bronze")).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_dead_letter_moves_message() {
        let queue = InMemoryQueue::default();
        queue.send(QueueMessage::new("r1", "bronze")).await.unwrap();
        let delivery = queue.receive(Duration::ZERO).await.unwrap().unwrap();

        queue.dead_letter(&delivery, "attempts exhausted").await.unwrap();

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "attempts exhausted");
        assert!(queue.is_idle());
    }
}
