//! Artifact store - files kept after a job finishes
//!
//! Layout: `<root>/<execution>/<job>/<destination>`, with test reports
//! under `<root>/<execution>/<job>/test-results/`.

use crate::persistence::cache::copy_tree;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Subdirectory for `store_test_results`
pub const TEST_RESULTS_DIR: &str = "test-results";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact path {} does not exist", .0.display())]
    NotFound(PathBuf),

    #[error("invalid artifact destination '{0}'")]
    InvalidDestination(String),

    #[error("failed to store artifact {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact task failed: {0}")]
    Task(String),
}

/// A stored file or directory
#[derive(Debug, Clone, PartialEq)]
pub struct StoredArtifact {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub size_bytes: u64,
}

/// Artifact directory shared by all runs
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store under the platform data directory
    pub fn with_default_path() -> Self {
        let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join("cirun").join("artifacts"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one job's artifacts
    pub fn job_dir(&self, execution_id: Uuid, job: &str) -> PathBuf {
        self.root.join(execution_id.to_string()).join(job)
    }

    /// Copy `source` into the job's artifacts, under `destination` or its file name
    pub async fn store(
        &self,
        execution_id: Uuid,
        job: &str,
        source: &Path,
        destination: Option<&str>,
    ) -> Result<StoredArtifact, ArtifactError> {
        let relative = match destination {
            Some(dest) => checked_relative(dest)?,
            None => PathBuf::from(
                source
                    .file_name()
                    .ok_or_else(|| ArtifactError::InvalidDestination(source.display().to_string()))?,
            ),
        };
        self.copy_into(source, self.job_dir(execution_id, job).join(relative))
            .await
    }

    /// Copy test reports into `test-results/`
    pub async fn store_test_results(
        &self,
        execution_id: Uuid,
        job: &str,
        source: &Path,
    ) -> Result<StoredArtifact, ArtifactError> {
        let name = source
            .file_name()
            .ok_or_else(|| ArtifactError::InvalidDestination(source.display().to_string()))?;
        let dest = self
            .job_dir(execution_id, job)
            .join(TEST_RESULTS_DIR)
            .join(name);
        self.copy_into(source, dest).await
    }

    async fn copy_into(&self, source: &Path, dest: PathBuf) -> Result<StoredArtifact, ArtifactError> {
        if source.symlink_metadata().is_err() {
            return Err(ArtifactError::NotFound(source.to_path_buf()));
        }

        let source = source.to_path_buf();
        let task_source = source.clone();
        let task_dest = dest.clone();
        let size_bytes = tokio::task::spawn_blocking(move || copy_tree(&task_source, &task_dest))
            .await
            .map_err(|e| ArtifactError::Task(e.to_string()))?
            .map_err(|e| ArtifactError::Io {
                path: dest.clone(),
                source: e,
            })?;

        debug!("Stored {} -> {}", source.display(), dest.display());
        Ok(StoredArtifact {
            source,
            destination: dest,
            size_bytes,
        })
    }
}

/// Reject absolute destinations and `..` components
fn checked_relative(dest: &str) -> Result<PathBuf, ArtifactError> {
    let path = Path::new(dest);
    let ok = !dest.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(path.to_path_buf())
    } else {
        Err(ArtifactError::InvalidDestination(dest.to_string()))
    }
}
