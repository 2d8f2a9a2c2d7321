//! Checkpoint store protocol and in-memory backend.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use super::Watermark;
use crate::errors::MedallionError;

/// Protocol for checkpoint storage backends.
///
/// A store holds one watermark per source. Writes go exclusively through
/// [`CheckpointStore::compare_and_set`], which is how concurrent runs touching
/// the same source are serialised.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Reads the watermark for a source.
    async fn get(&self, source: &str) -> Result<Option<Watermark>, MedallionError>;

    /// Replaces the watermark for `source` with `new` if the stored value
    /// still equals `expected` (`None` meaning absent).
    ///
    /// Returns `Ok(false)` when another writer got there first or when `new`
    /// would lower the stored value.
    async fn compare_and_set(
        &self,
        source: &str,
        expected: Option<&Watermark>,
        new: &Watermark,
    ) -> Result<bool, MedallionError>;

    /// Returns every stored checkpoint.
    async fn snapshot(&self) -> Result<HashMap<String, Watermark>, MedallionError>;
}

/// Applies a compare-and-set to a map in place.
///
/// Shared by the in-memory and file backends so both enforce the same rules.
pub(crate) fn apply_cas(
    entries: &mut HashMap<String, Watermark>,
    source: &str,
    expected: Option<&Watermark>,
    new: &Watermark,
) -> Result<bool, MedallionError> {
    let current = entries.get(source);
    if current != expected {
        return Ok(false);
    }
    if let Some(current) = current {
        if current.checked_cmp(new)? == Ordering::Greater {
            return Ok(false);
        }
    }
    entries.insert(source.to_string(), new.clone());
    Ok(true)
}

/// In-memory checkpoint store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCheckpointStore {
    entries: Arc<Mutex<HashMap<String, Watermark>>>,
}

impl InMemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with initial watermarks.
    #[must_use]
    pub fn with_entries(entries: impl IntoIterator<Item = (String, Watermark)>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(entries.into_iter().collect())),
        }
    }

    /// Returns the number of sources tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if no source has a checkpoint.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, source: &str) -> Result<Option<Watermark>, MedallionError> {
        Ok(self.entries.lock().get(source).cloned())
    }

    async fn compare_and_set(
        &self,
        source: &str,
        expected: Option<&Watermark>,
        new: &Watermark,
    ) -> Result<bool, MedallionError> {
        let mut entries = self.entries.lock();
        apply_cas(&mut entries, source, expected, new)
    }

    async fn snapshot(&self) -> Result<HashMap<String, Watermark>, MedallionError> {
        Ok(self.entries.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cas_from_absent() {
        let store = InMemoryCheckpointStore::new();
        assert!(store
            .compare_and_set("orders", None, &Watermark::Integer(10))
            .await
            .unwrap());
        assert_eq!(store.get("orders").await.unwrap(), Some(Watermark::Integer(10)));
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_expected() {
        let store = InMemoryCheckpointStore::with_entries([("orders".into(), Watermark::Integer(110))]);

        let applied = store
            .compare_and_set("orders", Some(&Watermark::Integer(100)), &Watermark::Integer(105))
            .await
            .unwrap();

        assert!(!applied);
        assert_eq!(store.get("orders").await.unwrap(), Some(Watermark::Integer(110)));
    }

    #[tokio::test]
    async fn test_cas_rejects_lowering() {
        let store = InMemoryCheckpointStore::with_entries([("orders".into(), Watermark::Integer(100))]);

        let applied = store
            .compare_and_set("orders", Some(&Watermark::Integer(100)), &Watermark::Integer(90))
            .await
            .unwrap();

        assert!(!applied);
        assert_eq!(store.get("orders").await.unwrap(), Some(Watermark::Integer(100)));
    }

    #[tokio::test]
    async fn test_cas_kind_mismatch_errors() {
        let store = InMemoryCheckpointStore::with_entries([("orders".into(), Watermark::Integer(100))]);

        let result = store
            .compare_and_set(
                "orders",
                Some(&Watermark::Integer(100)),
                &Watermark::Text("abc".into()),
            )
            .await;

        assert!(matches!(result, Err(MedallionError::InvalidWatermark(_))));
    }

    #[tokio::test]
    async fn test_concurrent_cas_single_winner() {
        let store = InMemoryCheckpointStore::with_entries([("orders".into(), Watermark::Integer(100))]);
        let baseline = Watermark::Integer(100);

        let (a, b) = tokio::join!(
            store.compare_and_set("orders", Some(&baseline), &Watermark::Integer(110)),
            store.compare_and_set("orders", Some(&baseline), &Watermark::Integer(108)),
        );

        let wins = [a.unwrap(), b.unwrap()].iter().filter(|w| **w).count();
        assert_eq!(wins, 1);
    }
}
