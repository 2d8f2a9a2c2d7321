//! Filesystem-backed output store.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::OutputStore;
use crate::core::DatasetRef;
use crate::errors::MedallionError;
use crate::pipeline::StageDefinition;

/// Stages outputs under `staging_dir` and publishes them by rename into
/// `output_dir/<layer>/<stage>/<run_id>`.
///
/// Each stage directory also holds a `.latest` file naming the run that
/// committed last. Both directories should live on the same filesystem so
/// that commit is a single rename.
#[derive(Debug, Clone)]
pub struct LocalOutputStore {
    staging_dir: PathBuf,
    output_dir: PathBuf,
}

const LATEST: &str = ".latest";

impl LocalOutputStore {
    /// Creates a store over the two directories.
    #[must_use]
    pub fn new(staging_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    /// Directory holding every committed output of `stage`.
    #[must_use]
    pub fn stage_dir(&self, stage: &StageDefinition) -> PathBuf {
        self.output_dir
            .join(stage.layer.to_string())
            .join(&stage.name)
    }

    /// Where `run_id`'s committed output of `stage` lives.
    #[must_use]
    pub fn output_path(&self, run_id: &str, stage: &StageDefinition) -> PathBuf {
        self.stage_dir(stage).join(run_id)
    }

    async fn point_latest(
        &self,
        stage: &StageDefinition,
        run_id: &str,
    ) -> Result<(), MedallionError> {
        let dir = self.stage_dir(stage);
        let tmp = dir.join(format!("{LATEST}.{run_id}.tmp"));
        tokio::fs::write(&tmp, run_id.as_bytes()).await?;
        tokio::fs::rename(&tmp, dir.join(LATEST)).await?;
        Ok(())
    }
}

async fn remove_existing(path: &Path) -> Result<(), MedallionError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => Ok(tokio::fs::remove_dir_all(path).await?),
        Ok(_) => Ok(tokio::fs::remove_file(path).await?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl OutputStore for LocalOutputStore {
    async fn staging_location(
        &self,
        run_id: &str,
        stage: &StageDefinition,
        attempt: u32,
    ) -> Result<DatasetRef, MedallionError> {
        let dir = self
            .staging_dir
            .join(stage.layer.to_string())
            .join(&stage.name);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{run_id}-{attempt}.part"));
        // A previous delivery of the same attempt may have left a partial file.
        remove_existing(&path).await?;
        Ok(DatasetRef::new(path.to_string_lossy()))
    }

    async fn commit(
        &self,
        run_id: &str,
        stage: &StageDefinition,
        staged: &DatasetRef,
    ) -> Result<DatasetRef, MedallionError> {
        let staged_path = Path::new(staged.as_str());
        if tokio::fs::metadata(staged_path).await.is_err() {
            tokio::fs::write(staged_path, b"").await?;
        }

        tokio::fs::create_dir_all(self.stage_dir(stage)).await?;
        let target = self.output_path(run_id, stage);
        remove_existing(&target).await?;
        tokio::fs::rename(staged_path, &target).await?;
        self.point_latest(stage, run_id).await?;

        debug!(
            run_id = %run_id,
            stage = %stage.name,
            output = %target.display(),
            "Committed stage output"
        );
        Ok(DatasetRef::new(target.to_string_lossy()))
    }

    async fn discard(&self, staged: &DatasetRef) -> Result<(), MedallionError> {
        remove_existing(Path::new(staged.as_str())).await
    }

    async fn committed(
        &self,
        stage: &StageDefinition,
    ) -> Result<Option<DatasetRef>, MedallionError> {
        let pointer = self.stage_dir(stage).join(LATEST);
        let run_id = match tokio::fs::read_to_string(&pointer).await {
            Ok(run_id) => run_id,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let target = self.output_path(run_id.trim(), stage);
        match tokio::fs::metadata(&target).await {
            Ok(_) => Ok(Some(DatasetRef::new(target.to_string_lossy()))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
