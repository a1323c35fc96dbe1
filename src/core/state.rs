//! Execution state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Overall pipeline execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Pipeline has not started
    Pending,
    /// Pipeline is currently running
    Running,
    /// Every job completed successfully
    Completed,
    /// At least one job failed or was skipped because of a failure
    Failed,
    /// Pipeline was cancelled
    Cancelled,
}

/// Outcome of a single step inside a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    Success,
    Failed,
    Skipped,
}

/// Recorded result of one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step display name
    pub name: String,

    pub outcome: StepOutcome,

    /// Exit code for shell steps
    pub exit_code: Option<i32>,

    /// Captured output (stdout followed by stderr) or a short message
    pub output: String,

    pub duration_ms: u64,
}

/// State of a single job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobState {
    /// Job is waiting for the jobs it requires (first execution)
    Pending,
    /// Job is waiting to be retried (preserves attempt count)
    Retrying {
        attempt: usize,
    },
    /// Job is currently running
    Running {
        started_at: DateTime<Utc>,
        attempt: usize,
    },
    /// Every step ran and none failed
    Completed {
        steps: Vec<StepResult>,
        attempts: usize,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    },
    /// A step failed (all retries exhausted)
    Failed {
        error: String,
        steps: Vec<StepResult>,
        attempts: usize,
        last_started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
    },
    /// Job never ran, e.g. a required job failed
    Skipped {
        reason: String,
    },
    /// Job was interrupted by cancellation
    Cancelled {
        steps: Vec<StepResult>,
    },
}

impl JobState {
    /// Check if job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed { .. }
                | JobState::Failed { .. }
                | JobState::Skipped { .. }
                | JobState::Cancelled { .. }
        )
    }

    /// Check if job finished without failing
    pub fn is_success(&self) -> bool {
        matches!(self, JobState::Completed { .. })
    }

    /// Step results recorded so far, if any
    pub fn step_results(&self) -> &[StepResult] {
        match self {
            JobState::Completed { steps, .. }
            | JobState::Failed { steps, .. }
            | JobState::Cancelled { steps } => steps,
            _ => &[],
        }
    }

    /// Short label used in summaries and the history store
    pub fn label(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Retrying { .. } => "retrying",
            JobState::Running { .. } => "running",
            JobState::Completed { .. } => "completed",
            JobState::Failed { .. } => "failed",
            JobState::Skipped { .. } => "skipped",
            JobState::Cancelled { .. } => "cancelled",
        }
    }
}

/// Overall pipeline state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    /// Unique execution ID
    pub execution_id: Uuid,

    /// Current execution status
    pub status: ExecutionStatus,

    /// When execution started
    pub started_at: Option<DateTime<Utc>>,

    /// When execution completed/failed
    pub completed_at: Option<DateTime<Utc>>,

    /// Total number of jobs
    pub total_jobs: usize,

    /// Number of completed jobs
    pub completed_jobs: usize,

    /// Number of failed jobs
    pub failed_jobs: usize,

    /// Number of skipped jobs
    pub skipped_jobs: usize,

    /// Number of currently running jobs
    pub running_jobs: usize,
}

impl PipelineState {
    /// Create a new pipeline state
    pub fn new() -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            status: ExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            total_jobs: 0,
            completed_jobs: 0,
            failed_jobs: 0,
            skipped_jobs: 0,
            running_jobs: 0,
        }
    }

    /// Mark pipeline as started
    pub fn start(&mut self, total_jobs: usize) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
        self.total_jobs = total_jobs;
    }

    /// Mark pipeline as completed
    pub fn complete(&mut self) {
        self.status = ExecutionStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark pipeline as failed
    pub fn fail(&mut self) {
        self.status = ExecutionStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark pipeline as cancelled
    pub fn cancel(&mut self) {
        self.status = ExecutionStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Calculate progress percentage (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.total_jobs == 0 {
            return 0.0;
        }
        (self.completed_jobs + self.failed_jobs + self.skipped_jobs) as f64 / self.total_jobs as f64
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}
