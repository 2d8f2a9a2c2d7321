//! One-in-flight-per-(run, stage) exclusion.

use dashmap::DashSet;
use std::sync::Arc;

type StageKey = (String, String);

/// Tracks which `(run, stage)` pairs are currently being executed.
///
/// Workers acquire a lease before executing a message; a second delivery for
/// the same pair is deferred while the lease is held.
#[derive(Debug, Clone, Default)]
pub struct InFlightGuard {
    active: Arc<DashSet<StageKey>>,
}

impl InFlightGuard {
    /// Creates an empty guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `(run_id, stage)`, or returns `None` if it is already claimed.
    #[must_use]
    pub fn try_acquire(&self, run_id: &str, stage: &str) -> Option<InFlightLease> {
        let key = (run_id.to_string(), stage.to_string());
        if self.active.insert(key.clone()) {
            Some(InFlightLease {
                active: Arc::clone(&self.active),
                key,
            })
        } else {
            None
        }
    }

    /// Returns true if `(run_id, stage)` is claimed.
    #[must_use]
    pub fn is_active(&self, run_id: &str, stage: &str) -> bool {
        self.active.contains(&(run_id.to_string(), stage.to_string()))
    }

    /// Number of claimed pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Returns true if nothing is claimed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// Releases its `(run, stage)` claim on drop.
#[derive(Debug)]
pub struct InFlightLease {
    active: Arc<DashSet<StageKey>>,
    key: StageKey,
}

impl Drop for InFlightLease {
    fn drop(&mut self) {
        self.active.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_blocked_until_drop() {
        let guard = InFlightGuard::new();

        let lease = guard.try_acquire("r1", "silver").unwrap();
        assert!(guard.try_acquire("r1", "silver").is_none());
        assert!(guard.try_acquire("r1", "gold").is_some());
        assert!(guard.try_acquire("r2", "silver").is_some());

        drop(lease);
        assert!(!guard.is_active("r1", "silver"));
        assert!(guard.try_acquire("r1", "silver").is_some());
    }
}
