//! Main execution engine - orchestrates the entire pipeline run

use crate::{
    core::{ExecutionStatus, JobState, Pipeline},
    execution::{
        events::{EventEmitter, ExecutionEvent},
        ExecutionScheduler, JobExecutor, JobOutcome, SchedulingStrategy,
    },
};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// What a finished job task reports back
struct Finished {
    job_id: String,
    attempt: usize,
    started_at: DateTime<Utc>,
    outcome: JobOutcome,
}

/// Main pipeline execution engine
pub struct ExecutionEngine {
    scheduler: Arc<Mutex<ExecutionScheduler>>,
    executor: Arc<JobExecutor>,
    events: EventEmitter,
    cancelled: Arc<AtomicBool>,
}

impl ExecutionEngine {
    pub fn new(executor: JobExecutor, strategy: SchedulingStrategy) -> Self {
        let events = EventEmitter::default();
        let cancelled = Arc::new(AtomicBool::new(false));
        let executor = Arc::new(executor.with_events(events.clone(), cancelled.clone()));
        let scheduler = Arc::new(Mutex::new(ExecutionScheduler::new(strategy)));

        Self {
            scheduler,
            executor,
            events,
            cancelled,
        }
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler);
    }

    /// Flag that stops the run when set
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Request cancellation; running steps are interrupted
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Execute the entire pipeline
    pub async fn execute(&self, pipeline: &mut Pipeline) -> ExecutionStatus {
        let execution_id = pipeline.state.execution_id;
        let pipeline_name = pipeline.name.clone();

        info!("Starting pipeline execution: {} ({})", pipeline_name, execution_id);
        pipeline.state.start(pipeline.jobs.len());
        self.events.emit(ExecutionEvent::PipelineStarted {
            execution_id,
            pipeline_name: pipeline_name.clone(),
            total_jobs: pipeline.jobs.len(),
        });

        let mut running: JoinSet<Finished> = JoinSet::new();

        loop {
            self.skip_blocked(pipeline);

            if !self.is_cancelled() {
                let job_ids = {
                    let scheduler = self.scheduler.lock().await;
                    scheduler.next_jobs(pipeline)
                };
                for job_id in job_ids {
                    self.start_job(pipeline, &job_id, &mut running);
                }
            }

            self.update_state_counts(pipeline);

            let Some(joined) = running.join_next().await else {
                break;
            };

            match joined {
                Ok(finished) => self.finish_job(pipeline, finished),
                // Job tasks catch their own panics, so this only happens on abort
                Err(e) => error!("Job task failed: {}", e),
            }
        }

        let status = if self.is_cancelled() {
            for job in pipeline.jobs.values_mut() {
                if !job.state.is_terminal() {
                    job.state = JobState::Cancelled { steps: vec![] };
                }
            }
            pipeline.state.cancel();
            ExecutionStatus::Cancelled
        } else if pipeline.has_failed() || !pipeline.is_complete() {
            if !pipeline.is_complete() {
                error!("No jobs ready to run and none running - pipeline stuck");
            }
            pipeline.state.fail();
            ExecutionStatus::Failed
        } else {
            pipeline.state.complete();
            ExecutionStatus::Completed
        };
        self.update_state_counts(pipeline);

        info!("Pipeline execution finished: {} - {:?}", pipeline_name, status);
        self.events.emit(ExecutionEvent::PipelineCompleted {
            execution_id,
            status,
        });

        status
    }

    /// Mark pending jobs whose requirements can no longer succeed
    fn skip_blocked(&self, pipeline: &mut Pipeline) {
        // Skipping one job can block its own dependents
        loop {
            let blocked = pipeline.blocked_jobs();
            if blocked.is_empty() {
                return;
            }

            for (job_id, requirement) in blocked {
                let reason = format!("Required job '{}' did not succeed", requirement);
                warn!("Skipping job {}: {}", job_id, reason);
                if let Some(job) = pipeline.job_mut(&job_id) {
                    job.state = JobState::Skipped {
                        reason: reason.clone(),
                    };
                }
                self.events.emit(ExecutionEvent::JobSkipped { job_id, reason });
            }
        }
    }

    fn start_job(&self, pipeline: &mut Pipeline, job_id: &str, running: &mut JoinSet<Finished>) {
        let Some(job) = pipeline.job_mut(job_id) else {
            warn!("Scheduled job {} not found", job_id);
            return;
        };

        let attempt = match job.state {
            JobState::Retrying { attempt } => attempt,
            _ => 1,
        };
        let started_at = Utc::now();
        job.state = JobState::Running {
            started_at,
            attempt,
        };
        let job = job.clone();

        info!("Starting job {} (attempt {})", job.id, attempt);
        self.events.emit(ExecutionEvent::JobStarted {
            job_id: job.id.clone(),
            attempt,
        });

        let executor = self.executor.clone();
        let variables = pipeline.variables.clone();
        let execution_id = pipeline.state.execution_id;

        running.spawn(async move {
            let job_id = job.id.clone();
            let task = tokio::spawn(async move { executor.execute(execution_id, &job, &variables).await });
            let outcome = task
                .await
                .unwrap_or_else(|e| JobOutcome::failed(format!("Job task panicked: {}", e)));
            Finished {
                job_id,
                attempt,
                started_at,
                outcome,
            }
        });
    }

    fn finish_job(&self, pipeline: &mut Pipeline, finished: Finished) {
        let Finished {
            job_id,
            attempt,
            started_at,
            outcome,
        } = finished;
        let Some(job) = pipeline.job_mut(&job_id) else {
            return;
        };

        let now = Utc::now();
        if outcome.cancelled {
            warn!("Job {} cancelled", job_id);
            job.state = JobState::Cancelled {
                steps: outcome.steps,
            };
            self.events.emit(ExecutionEvent::JobFailed {
                job_id,
                error: "Cancelled".to_string(),
            });
            return;
        }

        match outcome.error {
            None => {
                info!("Job {} completed", job_id);
                job.state = JobState::Completed {
                    steps: outcome.steps,
                    attempts: attempt,
                    started_at,
                    completed_at: now,
                };
                self.events.emit(ExecutionEvent::JobCompleted {
                    job_id,
                    duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
                });
            }
            Some(error) if job.can_retry(attempt) && !self.is_cancelled() => {
                warn!(
                    "Job {} failed on attempt {}, retrying (max_retries {}): {}",
                    job_id, attempt, job.max_retries, error
                );
                job.state = JobState::Retrying {
                    attempt: attempt + 1,
                };
                self.events.emit(ExecutionEvent::JobRetrying {
                    job_id,
                    attempt: attempt + 1,
                    max_retries: job.max_retries,
                    error,
                });
            }
            Some(error) => {
                error!("Job {} failed: {}", job_id, error);
                job.state = JobState::Failed {
                    error: error.clone(),
                    steps: outcome.steps,
                    attempts: attempt,
                    last_started_at: started_at,
                    failed_at: now,
                };
                self.events.emit(ExecutionEvent::JobFailed { job_id, error });
            }
        }
    }

    /// Update pipeline state counts
    fn update_state_counts(&self, pipeline: &mut Pipeline) {
        let mut completed = 0;
        let mut failed = 0;
        let mut skipped = 0;
        let mut running = 0;

        for job in pipeline.jobs.values() {
            match job.state {
                JobState::Completed { .. } => completed += 1,
                JobState::Failed { .. } | JobState::Cancelled { .. } => failed += 1,
                JobState::Skipped { .. } => skipped += 1,
                JobState::Running { .. } => running += 1,
                JobState::Pending | JobState::Retrying { .. } => {}
            }
        }

        pipeline.state.completed_jobs = completed;
        pipeline.state.failed_jobs = failed;
        pipeline.state.skipped_jobs = skipped;
        pipeline.state.running_jobs = running;
    }
}
