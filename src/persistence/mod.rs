//! Persistence: dependency cache, artifacts and execution history

pub mod artifacts;
pub mod cache;
#[cfg(feature = "sqlite")]
pub mod store;

pub use artifacts::{ArtifactError, ArtifactStore, StoredArtifact};
pub use cache::{CacheEntry, CacheError, CacheStore, DirectoryCacheStore, SaveOutcome};
#[cfg(feature = "sqlite")]
pub use store::SqliteExecutionStore;

pub use crate::core::ExecutionStatus;
use crate::core::{JobState, Pipeline};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Outcome of one job in an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,

    /// `completed`, `failed`, `skipped`, ...
    pub status: String,

    pub attempts: usize,

    pub duration_ms: Option<u64>,

    /// Failure or skip reason
    pub message: Option<String>,
}

/// Summary of a pipeline execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Unique execution ID
    pub execution_id: Uuid,

    /// Pipeline name
    pub pipeline_name: String,

    pub branch: String,

    pub revision: String,

    /// Execution status
    pub status: ExecutionStatus,

    /// When execution started
    pub started_at: DateTime<Utc>,

    /// When execution completed (if complete)
    pub completed_at: Option<DateTime<Utc>>,

    /// Progress (0.0 to 1.0)
    pub progress: f64,

    pub completed_jobs: usize,

    pub failed_jobs: usize,

    pub skipped_jobs: usize,

    pub total_jobs: usize,

    /// Per-job outcome, sorted by job id
    pub jobs: Vec<JobSummary>,
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Save a pipeline execution
    async fn save_execution(&self, execution: &ExecutionSummary) -> Result<()>;

    /// Load an execution by ID
    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionSummary>>;

    /// List all executions for a pipeline, most recent first
    async fn list_executions(&self, pipeline_name: &str) -> Result<Vec<ExecutionSummary>>;

    /// Most recent execution of a pipeline
    async fn get_latest_execution(&self, pipeline_name: &str) -> Result<Option<ExecutionSummary>>;

    /// Remove an execution record
    async fn delete_execution(&self, execution_id: Uuid) -> Result<()>;

    /// List all pipeline names
    async fn list_pipelines(&self) -> Result<Vec<String>>;
}

/// In-memory persistence (for testing or ephemeral use)
pub struct InMemoryPersistence {
    executions: tokio::sync::RwLock<HashMap<Uuid, ExecutionSummary>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self {
            executions: tokio::sync::RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_execution(&self, execution: &ExecutionSummary) -> Result<()> {
        let mut execs = self.executions.write().await;
        execs.insert(execution.execution_id, execution.clone());
        Ok(())
    }

    async fn load_execution(&self, execution_id: Uuid) -> Result<Option<ExecutionSummary>> {
        let execs = self.executions.read().await;
        Ok(execs.get(&execution_id).cloned())
    }

    async fn list_executions(&self, pipeline_name: &str) -> Result<Vec<ExecutionSummary>> {
        let execs = self.executions.read().await;
        let mut result: Vec<ExecutionSummary> = execs
            .values()
            .filter(|e| e.pipeline_name == pipeline_name)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(result)
    }

    async fn get_latest_execution(&self, pipeline_name: &str) -> Result<Option<ExecutionSummary>> {
        Ok(self.list_executions(pipeline_name).await?.into_iter().next())
    }

    async fn delete_execution(&self, execution_id: Uuid) -> Result<()> {
        self.executions.write().await.remove(&execution_id);
        Ok(())
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let execs = self.executions.read().await;
        let mut names: Vec<String> = execs.values().map(|e| e.pipeline_name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

fn job_summary(id: &str, state: &JobState) -> JobSummary {
    let (attempts, duration_ms, message) = match state {
        JobState::Completed {
            attempts,
            started_at,
            completed_at,
            ..
        } => (
            *attempts,
            Some((*completed_at - *started_at).num_milliseconds().max(0) as u64),
            None,
        ),
        JobState::Failed {
            attempts,
            error,
            last_started_at,
            failed_at,
            ..
        } => (
            *attempts,
            Some((*failed_at - *last_started_at).num_milliseconds().max(0) as u64),
            Some(error.clone()),
        ),
        JobState::Skipped { reason } => (0, None, Some(reason.clone())),
        JobState::Running { attempt, .. } | JobState::Retrying { attempt } => (*attempt, None, None),
        JobState::Pending | JobState::Cancelled { .. } => (0, None, None),
    };

    JobSummary {
        job_id: id.to_string(),
        status: state.label().to_string(),
        attempts,
        duration_ms,
        message,
    }
}

/// Create a summary from a pipeline
pub fn create_summary(pipeline: &Pipeline, branch: &str, revision: &str) -> ExecutionSummary {
    let mut jobs: Vec<JobSummary> = pipeline
        .jobs
        .values()
        .map(|j| job_summary(&j.id, &j.state))
        .collect();
    jobs.sort_by(|a, b| a.job_id.cmp(&b.job_id));

    ExecutionSummary {
        execution_id: pipeline.state.execution_id,
        pipeline_name: pipeline.name.clone(),
        branch: branch.to_string(),
        revision: revision.to_string(),
        status: pipeline.state.status,
        started_at: pipeline.state.started_at.unwrap_or_else(Utc::now),
        completed_at: pipeline.state.completed_at,
        progress: pipeline.state.progress(),
        completed_jobs: pipeline.state.completed_jobs,
        failed_jobs: pipeline.state.failed_jobs,
        skipped_jobs: pipeline.state.skipped_jobs,
        total_jobs: pipeline.state.total_jobs,
        jobs,
    }
}
