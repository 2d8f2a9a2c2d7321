//! Per-outcome counters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::core::{Outcome, RunStatus};

/// Lock-free counters incremented once per recorded event.
#[derive(Debug, Default)]
pub struct OutcomeCounters {
    outcomes: [AtomicU64; Outcome::ALL.len()],
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
}

fn slot(outcome: Outcome) -> usize {
    Outcome::ALL
        .iter()
        .position(|o| *o == outcome)
        .unwrap_or_default()
}

impl OutcomeCounters {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one invocation outcome.
    pub fn record(&self, outcome: Outcome) {
        self.outcomes[slot(outcome)].fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a finished run.
    pub fn record_run(&self, status: RunStatus) {
        match status {
            RunStatus::Completed => {
                self.runs_completed.fetch_add(1, Ordering::Relaxed);
            }
            RunStatus::Failed => {
                self.runs_failed.fetch_add(1, Ordering::Relaxed);
            }
            RunStatus::Running => {}
        }
    }

    /// Current count for `outcome`.
    #[must_use]
    pub fn get(&self, outcome: Outcome) -> u64 {
        self.outcomes[slot(outcome)].load(Ordering::Relaxed)
    }

    /// A serialisable copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            outcomes: Outcome::ALL
                .iter()
                .map(|o| (o.to_string(), self.get(*o)))
                .collect(),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counter values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    /// Invocations by outcome name.
    pub outcomes: BTreeMap<String, u64>,
    /// Runs that completed.
    pub runs_completed: u64,
    /// Runs that failed.
    pub runs_failed: u64,
}

impl CountersSnapshot {
    /// Count for `outcome`.
    #[must_use]
    pub fn outcome(&self, outcome: Outcome) -> u64 {
        self.outcomes
            .get(&outcome.to_string())
            .copied()
            .unwrap_or_default()
    }
}
