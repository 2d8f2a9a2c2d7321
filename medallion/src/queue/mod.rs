//! Queue chaining transport.
//!
//! Stage invocations travel as [`QueueMessage`]s through a [`QueueChannel`].
//! The channel is at-least-once; idempotency is enforced by the executor
//! against the run's status map, and [`InFlightGuard`] keeps at most one
//! execution per `(run, stage)` inside a process.

mod channel;
mod inflight;
mod message;

pub use channel::{DeadLetter, Delivery, InMemoryQueue, QueueChannel};
pub use inflight::{InFlightGuard, InFlightLease};
pub use message::QueueMessage;
