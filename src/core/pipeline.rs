//! Pipeline domain model

use crate::core::{
    config::PipelineConfig,
    matrix::ExpandedJob,
    state::{JobState, PipelineState},
    step::{Step, StepDefaults},
};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};

/// A concrete job in a pipeline
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique job name
    pub id: String,

    /// Name as declared in the job file (differs for matrix entries)
    pub base: String,

    /// Template the steps came from
    pub template: Option<String>,

    /// Container image
    pub image: Option<String>,

    pub working_directory: Option<String>,

    /// Job environment (template environment overridden by the job's)
    pub environment: HashMap<String, String>,

    pub steps: Vec<Step>,

    /// Jobs that must complete first
    pub requires: Vec<String>,

    /// Number of re-runs after a failure
    pub max_retries: usize,

    /// Timeout for the whole job (in seconds)
    pub timeout_secs: Option<u64>,

    pub state: JobState,
}

impl Job {
    /// Build a job from its expanded form
    pub fn from_expanded(
        expanded: &ExpandedJob,
        requires: Vec<String>,
        defaults: &StepDefaults,
    ) -> Result<Self> {
        let steps = expanded
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| {
                Step::from_config(s, defaults)
                    .with_context(|| format!("Job '{}' step {} is invalid", expanded.name, i + 1))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Job {
            id: expanded.name.clone(),
            base: expanded.base.clone(),
            template: expanded.template.clone(),
            image: expanded.image.clone(),
            working_directory: expanded.working_directory.clone(),
            environment: expanded.environment.clone(),
            steps,
            requires,
            max_retries: expanded.max_retries,
            timeout_secs: expanded.timeout_secs,
            state: JobState::Pending,
        })
    }

    /// Check if every required job completed
    pub fn requirements_met(&self, completed: &HashSet<String>) -> bool {
        self.requires.iter().all(|r| completed.contains(r))
    }

    /// Check if another attempt is allowed after `attempt` runs
    pub fn can_retry(&self, attempt: usize) -> bool {
        attempt <= self.max_retries
    }
}

/// A pipeline: the jobs selected for one run
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Git URL cloned by `checkout`
    pub repository: Option<String>,

    /// Variables available to all jobs
    pub variables: HashMap<String, String>,

    /// Jobs by id
    pub jobs: HashMap<String, Job>,

    /// Execution state
    pub state: PipelineState,

    /// Job execution order (topological sort)
    execution_order: Vec<String>,
}

impl Pipeline {
    /// Create a pipeline from configuration
    pub fn from_config(config: &PipelineConfig, workflow: Option<&str>) -> Result<Self> {
        let defaults = config.step_defaults();
        let expanded = config.expand_jobs()?;
        let edges = config.requires_edges(workflow, &expanded)?;
        if workflow.is_none() && config.workflows.len() > 1 {
            config
                .check_cycles(None, &expanded)
                .context("Workflows cannot be merged, choose one with --workflow")?;
        }

        let mut jobs = HashMap::new();
        for job in &expanded {
            if let Some(requires) = edges.get(&job.name) {
                jobs.insert(
                    job.name.clone(),
                    Job::from_expanded(job, requires.clone(), &defaults)?,
                );
            }
        }

        Ok(Self::from_jobs(
            config.name.clone(),
            config.repository.clone(),
            config.variables_as_string_map()?,
            jobs,
        ))
    }

    /// Assemble a pipeline from already-built jobs
    pub fn from_jobs(
        name: String,
        repository: Option<String>,
        variables: HashMap<String, String>,
        jobs: HashMap<String, Job>,
    ) -> Self {
        let execution_order = Self::topological_sort(&jobs);

        Pipeline {
            name,
            repository,
            variables,
            jobs,
            state: PipelineState::new(),
            execution_order,
        }
    }

    /// Keep only the named jobs and everything they transitively require
    pub fn select_jobs(&mut self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }

        let mut keep = HashSet::new();
        let mut stack: Vec<String> = Vec::new();
        for name in names {
            let matched: Vec<String> = self
                .jobs
                .values()
                .filter(|j| &j.id == name || &j.base == name)
                .map(|j| j.id.clone())
                .collect();
            if matched.is_empty() {
                anyhow::bail!("Job '{}' is not part of this pipeline", name);
            }
            stack.extend(matched);
        }

        while let Some(id) = stack.pop() {
            if keep.insert(id.clone()) {
                if let Some(job) = self.jobs.get(&id) {
                    stack.extend(job.requires.iter().cloned());
                }
            }
        }

        self.jobs.retain(|id, _| keep.contains(id));
        self.execution_order = Self::topological_sort(&self.jobs);
        Ok(())
    }

    /// Get a job by ID
    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    /// Get a mutable job by ID
    pub fn job_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    /// Get jobs ready to execute (requirements completed)
    pub fn ready_jobs(&self) -> Vec<&Job> {
        let completed: HashSet<String> = self
            .jobs
            .values()
            .filter(|j| j.state.is_success())
            .map(|j| j.id.clone())
            .collect();

        let mut ready: Vec<&Job> = self
            .jobs
            .values()
            .filter(|j| {
                matches!(j.state, JobState::Pending | JobState::Retrying { .. })
                    && j.requirements_met(&completed)
            })
            .collect();
        ready.sort_by(|a, b| a.id.cmp(&b.id));
        ready
    }

    /// Pending jobs that can never run, with the requirement that blocks them
    pub fn blocked_jobs(&self) -> Vec<(String, String)> {
        let mut blocked: Vec<(String, String)> = self
            .jobs
            .values()
            .filter(|j| matches!(j.state, JobState::Pending))
            .filter_map(|j| {
                j.requires
                    .iter()
                    .find(|r| {
                        self.jobs.get(*r).is_some_and(|dep| {
                            matches!(
                                dep.state,
                                JobState::Failed { .. }
                                    | JobState::Skipped { .. }
                                    | JobState::Cancelled { .. }
                            )
                        })
                    })
                    .map(|r| (j.id.clone(), r.clone()))
            })
            .collect();
        blocked.sort();
        blocked
    }

    /// Get all currently running jobs
    pub fn running_jobs(&self) -> Vec<&Job> {
        self.jobs
            .values()
            .filter(|j| matches!(j.state, JobState::Running { .. }))
            .collect()
    }

    /// Check if every job reached a terminal state
    pub fn is_complete(&self) -> bool {
        self.jobs.values().all(|j| j.state.is_terminal())
    }

    /// Check if any job failed
    pub fn has_failed(&self) -> bool {
        self.jobs
            .values()
            .any(|j| matches!(j.state, JobState::Failed { .. }))
    }

    /// Get execution order (topological sort)
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Calculate topological sort of jobs based on requirements
    fn topological_sort(jobs: &HashMap<String, Job>) -> Vec<String> {
        let mut result = Vec::new();
        let mut visited = HashSet::new();

        // Sort for deterministic order
        let mut job_ids: Vec<_> = jobs.keys().cloned().collect();
        job_ids.sort();

        for job_id in job_ids {
            Self::visit(&job_id, jobs, &mut visited, &mut result);
        }

        result
    }

    fn visit(
        job_id: &str,
        jobs: &HashMap<String, Job>,
        visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(job_id.to_string()) {
            return;
        }

        if let Some(job) = jobs.get(job_id) {
            for dep in &job.requires {
                Self::visit(dep, jobs, visited, result);
            }
            result.push(job_id.to_string());
        }
    }
}
