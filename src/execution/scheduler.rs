//! Execution scheduler - determines which jobs to start next

use crate::core::{JobState, Pipeline};
use std::collections::HashSet;

/// Strategy for scheduling job execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingStrategy {
    /// Execute jobs in dependency order, one at a time
    #[default]
    Sequential,

    /// Execute all ready jobs in parallel
    Parallel,

    /// Limited parallelism (max N concurrent jobs)
    LimitedParallel(usize),
}

/// Scheduler for determining which jobs to run
#[derive(Debug)]
pub struct ExecutionScheduler {
    strategy: SchedulingStrategy,
}

impl ExecutionScheduler {
    pub fn new(strategy: SchedulingStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Get the next batch of jobs to start
    pub fn next_jobs(&self, pipeline: &Pipeline) -> Vec<String> {
        match self.strategy {
            SchedulingStrategy::Sequential => self.next_sequential(pipeline),
            SchedulingStrategy::Parallel => self.next_parallel(pipeline),
            SchedulingStrategy::LimitedParallel(max) => self.next_limited_parallel(pipeline, max),
        }
    }

    fn next_sequential(&self, pipeline: &Pipeline) -> Vec<String> {
        if !pipeline.running_jobs().is_empty() {
            return vec![];
        }

        let completed: HashSet<String> = pipeline
            .jobs
            .values()
            .filter(|j| j.state.is_success())
            .map(|j| j.id.clone())
            .collect();

        // First ready job in execution order
        pipeline
            .execution_order()
            .iter()
            .filter_map(|id| pipeline.job(id))
            .find(|job| {
                matches!(job.state, JobState::Pending | JobState::Retrying { .. })
                    && job.requirements_met(&completed)
            })
            .map(|job| vec![job.id.clone()])
            .unwrap_or_default()
    }

    fn next_parallel(&self, pipeline: &Pipeline) -> Vec<String> {
        pipeline.ready_jobs().iter().map(|j| j.id.clone()).collect()
    }

    fn next_limited_parallel(&self, pipeline: &Pipeline, max: usize) -> Vec<String> {
        let running_count = pipeline.running_jobs().len();
        let remaining = max.max(1).saturating_sub(running_count);

        if remaining == 0 {
            return vec![];
        }

        pipeline
            .ready_jobs()
            .into_iter()
            .take(remaining)
            .map(|j| j.id.clone())
            .collect()
    }

    /// Check if there are more jobs to start
    pub fn has_more(&self, pipeline: &Pipeline) -> bool {
        !self.next_jobs(pipeline).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PipelineConfig;
    use chrono::Utc;

    const YAML: &str = r#"
name: pyani
templates:
  build:
    steps:
      - checkout
      - run: make test
jobs:
  lint:
    steps:
      - run: flake8
  build:
    template: build
    matrix:
      image: ["python:3.7", "python:3.8"]
  publish:
    steps:
      - run: make dist
workflows:
  main:
    jobs:
      - lint
      - build:
          requires: [lint]
      - publish:
          requires: [build]
"#;

    fn pipeline() -> Pipeline {
        PipelineConfig::from_yaml(YAML)
            .unwrap()
            .to_pipeline(None)
            .unwrap()
    }

    fn running() -> JobState {
        JobState::Running {
            started_at: Utc::now(),
            attempt: 1,
        }
    }

    fn completed() -> JobState {
        JobState::Completed {
            steps: vec![],
            attempts: 1,
            started_at: Utc::now(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_sequential_scheduler() {
        let mut pipeline = pipeline();
        let scheduler = ExecutionScheduler::new(SchedulingStrategy::Sequential);

        assert_eq!(scheduler.next_jobs(&pipeline), vec!["lint"]);

        pipeline.job_mut("lint").unwrap().state = running();
        assert!(scheduler.next_jobs(&pipeline).is_empty());

        pipeline.job_mut("lint").unwrap().state = completed();
        assert_eq!(scheduler.next_jobs(&pipeline).len(), 1);
    }

    #[test]
    fn test_parallel_scheduler() {
        let mut pipeline = pipeline();
        pipeline.job_mut("lint").unwrap().state = completed();
        let scheduler = ExecutionScheduler::new(SchedulingStrategy::Parallel);

        let next = scheduler.next_jobs(&pipeline);
        assert_eq!(next, vec!["build-3.7", "build-3.8"]);
    }

    #[test]
    fn test_limited_parallel_scheduler() {
        let mut pipeline = pipeline();
        pipeline.job_mut("lint").unwrap().state = completed();
        let scheduler = ExecutionScheduler::new(SchedulingStrategy::LimitedParallel(1));

        assert_eq!(scheduler.next_jobs(&pipeline), vec!["build-3.7"]);

        pipeline.job_mut("build-3.7").unwrap().state = running();
        assert!(!scheduler.has_more(&pipeline));
    }

    #[test]
    fn test_retrying_job_is_scheduled_again() {
        let mut pipeline = pipeline();
        pipeline.job_mut("lint").unwrap().state = JobState::Retrying { attempt: 2 };
        let scheduler = ExecutionScheduler::new(SchedulingStrategy::Sequential);

        assert_eq!(scheduler.next_jobs(&pipeline), vec!["lint"]);
    }
}
