//! Directory-backed run store.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::Mutex;

use super::{BeginOutcome, CompleteOutcome, FailOutcome, PipelineRun, RunStore};
use crate::core::DatasetRef;
use crate::errors::MedallionError;

/// Run store keeping one JSON file per run, `<dir>/<run_id>.json`.
///
/// Every mutation re-reads the run, applies it and rewrites the file through
/// a temporary file and rename while holding an in-process lock. Separate
/// processes sharing one directory are not serialised.
#[derive(Debug)]
pub struct FileRunStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileRunStore {
    /// Creates a store under `dir`. The directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    /// File holding `run_id`, or `None` if the id cannot name a file here.
    fn path(&self, run_id: &str) -> Option<PathBuf> {
        let valid = !run_id.is_empty()
            && run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        valid.then(|| self.dir.join(format!("{run_id}.json")))
    }

    async fn load(&self, run_id: &str) -> Result<Option<PipelineRun>, MedallionError> {
        let Some(path) = self.path(run_id) else {
            return Ok(None);
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn persist(&self, run: &PipelineRun) -> Result<(), MedallionError> {
        let path = self
            .path(&run.run_id)
            .ok_or_else(|| MedallionError::Internal(format!("invalid run id '{}'", run.run_id)))?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("json.tmp");

        let body = serde_json::to_vec_pretty(run)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn with_run<T, F>(&self, run_id: &str, f: F) -> Result<T, MedallionError>
    where
        T: Send,
        F: FnOnce(&mut PipelineRun) -> T + Send,
    {
        let _guard = self.lock.lock().await;
        let mut run = self
            .load(run_id)
            .await?
            .ok_or_else(|| MedallionError::RunNotFound(run_id.to_string()))?;
        let out = f(&mut run);
        self.persist(&run).await?;
        Ok(out)
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn insert(&self, run: PipelineRun) -> Result<(), MedallionError> {
        let _guard = self.lock.lock().await;
        if self.load(&run.run_id).await?.is_some() {
            return Err(MedallionError::Internal(format!(
                "run '{}' already exists",
                run.run_id
            )));
        }
        self.persist(&run).await?;
        tracing::debug!(run_id = %run.run_id, dir = %self.dir.display(), "Run persisted");
        Ok(())
    }

    async fn get(&self, run_id: &str) -> Result<Option<PipelineRun>, MedallionError> {
        let _guard = self.lock.lock().await;
        self.load(run_id).await
    }

    async fn list(&self) -> Result<Vec<PipelineRun>, MedallionError> {
        let _guard = self.lock.lock().await;
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            runs.push(serde_json::from_slice::<PipelineRun>(&bytes)?);
        }
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.run_id.cmp(&b.run_id)));
        Ok(runs)
    }

    async fn begin_stage(
        &self,
        run_id: &str,
        stage: &str,
        attempt: u32,
    ) -> Result<BeginOutcome, MedallionError> {
        self.with_run(run_id, |run| run.begin(stage, attempt)).await
    }

    async fn complete_stage(
        &self,
        run_id: &str,
        stage: &str,
        output: Option<DatasetRef>,
    ) -> Result<CompleteOutcome, MedallionError> {
        self.with_run(run_id, |run| run.complete(stage, output)).await
    }

    async fn fail_stage(
        &self,
        run_id: &str,
        stage: &str,
        reason: &str,
    ) -> Result<FailOutcome, MedallionError> {
        self.with_run(run_id, |run| run.fail(stage, reason)).await
    }

    async fn release_stage(&self, run_id: &str, stage: &str) -> Result<(), MedallionError> {
        self.with_run(run_id, |run| run.release(stage)).await
    }

    async fn mark_dispatched(&self, run_id: &str, stage: &str) -> Result<(), MedallionError> {
        self.with_run(run_id, |run| run.mark_dispatched(stage)).await
    }

    async fn undispatched_dependents(
        &self,
        run_id: &str,
        stage: &str,
    ) -> Result<Vec<String>, MedallionError> {
        let _guard = self.lock.lock().await;
        self.load(run_id)
            .await?
            .map(|run| run.undispatched_dependents(stage))
            .ok_or_else(|| MedallionError::RunNotFound(run_id.to_string()))
    }
}
