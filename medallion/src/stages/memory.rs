//! In-memory output store.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::OutputStore;
use crate::core::DatasetRef;
use crate::errors::MedallionError;
use crate::pipeline::StageDefinition;

/// Output store holding datasets as rows of JSON values, keyed by URI.
///
/// Staged datasets live under `mem://staging/...`; commit moves them to
/// `mem://<layer>/<stage>/<run_id>`.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutputStore {
    datasets: Arc<Mutex<HashMap<String, Vec<Value>>>>,
    latest: Arc<Mutex<HashMap<String, DatasetRef>>>,
}

impl MemoryOutputStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the rows at `dataset`.
    pub fn write(&self, dataset: &DatasetRef, rows: Vec<Value>) {
        self.datasets.lock().insert(dataset.uri.clone(), rows);
    }

    /// Appends rows to `dataset`.
    pub fn append(&self, dataset: &DatasetRef, rows: impl IntoIterator<Item = Value>) {
        self.datasets
            .lock()
            .entry(dataset.uri.clone())
            .or_default()
            .extend(rows);
    }

    /// Reads the rows at `dataset`, if it exists.
    #[must_use]
    pub fn rows(&self, dataset: &DatasetRef) -> Option<Vec<Value>> {
        self.datasets.lock().get(&dataset.uri).cloned()
    }

    /// Number of staged datasets that were neither committed nor discarded.
    #[must_use]
    pub fn staged_count(&self) -> usize {
        self.datasets
            .lock()
            .keys()
            .filter(|k| k.starts_with("mem://staging/"))
            .count()
    }

    fn output_ref(run_id: &str, stage: &StageDefinition) -> DatasetRef {
        DatasetRef::new(format!("mem://{}/{}/{run_id}", stage.layer, stage.name))
    }
}

#[async_trait]
impl OutputStore for MemoryOutputStore {
    async fn staging_location(
        &self,
        run_id: &str,
        stage: &StageDefinition,
        attempt: u32,
    ) -> Result<DatasetRef, MedallionError> {
        let staged = DatasetRef::new(format!(
            "mem://staging/{}/{run_id}/{attempt}",
            stage.name
        ));
        self.datasets.lock().remove(&staged.uri);
        Ok(staged)
    }

    async fn commit(
        &self,
        run_id: &str,
        stage: &StageDefinition,
        staged: &DatasetRef,
    ) -> Result<DatasetRef, MedallionError> {
        let target = Self::output_ref(run_id, stage);
        {
            let mut datasets = self.datasets.lock();
            let rows = datasets.remove(&staged.uri).unwrap_or_default();
            datasets.insert(target.uri.clone(), rows);
        }
        self.latest.lock().insert(stage.name.clone(), target.clone());
        Ok(target)
    }

    async fn discard(&self, staged: &DatasetRef) -> Result<(), MedallionError> {
        self.datasets.lock().remove(&staged.uri);
        Ok(())
    }

    async fn committed(
        &self,
        stage: &StageDefinition,
    ) -> Result<Option<DatasetRef>, MedallionError> {
        Ok(self.latest.lock().get(&stage.name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_staged_rows_invisible_until_commit() {
        let store = MemoryOutputStore::new();
        let stage = StageDefinition::silver("orders");

        let staged = store.staging_location("r1", &stage, 1).await.unwrap();
        store.write(&staged, vec![json!({"id": 1})]);
        assert!(store.committed(&stage).await.unwrap().is_none());
        assert_eq!(store.staged_count(), 1);

        let out = store.commit("r1", &stage, &staged).await.unwrap();
        assert_eq!(out.as_str(), "mem://silver/orders/r1");
        assert_eq!(store.committed(&stage).await.unwrap(), Some(out.clone()));
        assert_eq!(store.rows(&out).unwrap(), vec![json!({"id": 1})]);
        assert_eq!(store.staged_count(), 0);
    }

    #[tokio::test]
    async fn test_later_run_does_not_replace_earlier_output() {
        let store = MemoryOutputStore::new();
        let stage = StageDefinition::bronze("orders_raw");

        let mut published = Vec::new();
        for (run, rows) in [("r1", vec![json!(101), json!(110)]), ("r2", vec![])] {
            let staged = store.staging_location(run, &stage, 1).await.unwrap();
            store.write(&staged, rows);
            published.push(store.commit(run, &stage, &staged).await.unwrap());
        }

        assert_eq!(store.rows(&published[0]).unwrap(), vec![json!(101), json!(110)]);
        assert!(store.rows(&published[1]).unwrap().is_empty());
        assert_eq!(
            store.committed(&stage).await.unwrap().unwrap().as_str(),
            "mem://bronze/orders_raw/r2"
        );
    }

    #[tokio::test]
    async fn test_fresh_staging_location_is_empty() {
        let store = MemoryOutputStore::new();
        let stage = StageDefinition::bronze("raw");

        let staged = store.staging_location("r1", &stage, 1).await.unwrap();
        store.append(&staged, [json!(1)]);
        let again = store.staging_location("r1", &stage, 1).await.unwrap();
        assert!(store.rows(&again).is_none());
    }
}
