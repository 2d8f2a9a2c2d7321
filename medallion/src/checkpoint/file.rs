//! JSON-file checkpoint store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::store::{apply_cas, CheckpointStore};
use super::Watermark;
use crate::errors::MedallionError;

/// Checkpoint store persisted as a single JSON object keyed by source.
///
/// Every compare-and-set re-reads the file, applies the update and rewrites
/// it through a temporary file and rename, all while holding an in-process
/// lock. Separate processes sharing one file are not serialised.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCheckpointStore {
    /// Creates a store backed by `path`. The file is created on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// The backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<HashMap<String, Watermark>, MedallionError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn persist(&self, entries: &HashMap<String, Watermark>) -> Result<(), MedallionError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let body = serde_json::to_vec_pretty(entries)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, source: &str) -> Result<Option<Watermark>, MedallionError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(source))
    }

    async fn compare_and_set(
        &self,
        source: &str,
        expected: Option<&Watermark>,
        new: &Watermark,
    ) -> Result<bool, MedallionError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        if !apply_cas(&mut entries, source, expected, new)? {
            return Ok(false);
        }
        self.persist(&entries).await?;
        tracing::debug!(source, watermark = %new, path = %self.path.display(), "Checkpoint persisted");
        Ok(true)
    }

    async fn snapshot(&self) -> Result<HashMap<String, Watermark>, MedallionError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_reads_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints.json"));

        assert_eq!(store.get("orders").await.unwrap(), None);
        assert!(store.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cas_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("checkpoints.json");

        let store = FileCheckpointStore::new(&path);
        assert!(store
            .compare_and_set("orders", None, &Watermark::Integer(105))
            .await
            .unwrap());

        let reopened = FileCheckpointStore::new(&path);
        assert_eq!(reopened.get("orders").await.unwrap(), Some(Watermark::Integer(105)));

        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["orders"], 105);
    }

    #[tokio::test]
    async fn test_failed_cas_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints.json"));
        store
            .compare_and_set("orders", None, &Watermark::Integer(110))
            .await
            .unwrap();

        let applied = store
            .compare_and_set("orders", Some(&Watermark::Integer(100)), &Watermark::Integer(120))
            .await
            .unwrap();

        assert!(!applied);
        assert_eq!(store.get("orders").await.unwrap(), Some(Watermark::Integer(110)));
        assert!(!dir.path().join("checkpoints.json.tmp").exists());
    }
}
