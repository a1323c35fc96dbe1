//! Shared fixtures for scenario tests

use async_trait::async_trait;
use cirun::core::config::PipelineConfig;
use cirun::core::{ExecutionStatus, JobState, Pipeline, StepOutcome, StepResult};
use cirun::execution::{ExecutionEngine, ExecutionEvent, JobExecutor, RunSettings, SchedulingStrategy};
use cirun::persistence::{ArtifactStore, DirectoryCacheStore};
use cirun::runner::{
    CommandOutput, CommandRunner, OutputSink, RunnerError, ShellCommand, StreamKind,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Canned reaction to a script
#[derive(Debug, Clone, Default)]
pub struct MockResponse {
    pub exit_code: i32,
    pub stdout: String,

    /// Fail with this exit code for the first N matching calls
    pub fail_first: usize,

    /// Report a timeout instead of running
    pub timeout: bool,

    /// Files created relative to the working directory
    pub creates: Vec<(String, String)>,
}

impl MockResponse {
    pub fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            ..Default::default()
        }
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Default::default()
        }
    }

    pub fn flaky(failures: usize) -> Self {
        Self {
            fail_first: failures,
            ..Default::default()
        }
    }

    pub fn timeout() -> Self {
        Self {
            timeout: true,
            ..Default::default()
        }
    }

    pub fn creating(mut self, path: &str, contents: &str) -> Self {
        self.creates.push((path.to_string(), contents.to_string()));
        self
    }
}

/// Runner that records commands and answers by substring match
#[derive(Default)]
pub struct MockRunner {
    rules: Vec<(String, MockResponse)>,
    calls: Mutex<Vec<ShellCommand>>,
    matched: Mutex<HashMap<String, usize>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// First rule whose pattern occurs in the script wins
    pub fn on(mut self, pattern: &str, response: MockResponse) -> Self {
        self.rules.push((pattern.to_string(), response));
        self
    }

    pub fn calls(&self) -> Vec<ShellCommand> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls whose script contains `pattern`
    pub fn calls_matching(&self, pattern: &str) -> Vec<ShellCommand> {
        self.calls()
            .into_iter()
            .filter(|c| c.script.contains(pattern))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(
        &self,
        command: &ShellCommand,
        sink: Option<&dyn OutputSink>,
    ) -> Result<CommandOutput, RunnerError> {
        self.calls.lock().unwrap().push(command.clone());

        let Some((pattern, response)) = self
            .rules
            .iter()
            .find(|(pattern, _)| command.script.contains(pattern.as_str()))
        else {
            return Ok(CommandOutput::default());
        };

        if response.timeout {
            return Err(RunnerError::Timeout(command.timeout_secs));
        }

        let seen = {
            let mut matched = self.matched.lock().unwrap();
            let count = matched.entry(pattern.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if seen <= response.fail_first {
            return Ok(CommandOutput {
                exit_code: 1,
                stderr: format!("attempt {} failed\n", seen),
                ..Default::default()
            });
        }

        for (path, contents) in &response.creates {
            let target = command.working_dir.join(path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, contents)?;
        }

        if let Some(sink) = sink {
            for line in response.stdout.lines() {
                sink.on_line(StreamKind::Stdout, line);
            }
        }

        Ok(CommandOutput {
            exit_code: response.exit_code,
            stdout: response.stdout.clone(),
            ..Default::default()
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Temporary source, workspace, cache and artifact directories
pub struct Harness {
    _root: TempDir,
    pub source: PathBuf,
    pub workspace: PathBuf,
    pub cache_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub runner: Arc<MockRunner>,
    pub branch: String,
    pub keep_workspace: bool,
    pub overrides: HashMap<String, String>,
}

impl Harness {
    pub fn new(runner: MockRunner) -> Self {
        let root = TempDir::new().unwrap();
        let dir = |name: &str| {
            let path = root.path().join(name);
            std::fs::create_dir_all(&path).unwrap();
            path
        };

        let harness = Self {
            source: dir("source"),
            workspace: dir("workspace"),
            cache_dir: dir("cache"),
            artifacts_dir: dir("artifacts"),
            _root: root,
            runner: Arc::new(runner),
            branch: "master".to_string(),
            keep_workspace: false,
            overrides: HashMap::new(),
        };
        harness.write_source("requirements.txt", "biopython\nmatplotlib\n");
        harness.write_source("setup.py", "from setuptools import setup\nsetup()\n");
        harness
    }

    pub fn write_source(&self, path: &str, contents: &str) {
        let target = self.source.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(target, contents).unwrap();
    }

    pub fn artifacts(&self) -> ArtifactStore {
        ArtifactStore::new(&self.artifacts_dir)
    }

    pub fn executor(&self) -> JobExecutor {
        JobExecutor::new(
            self.runner.clone(),
            Arc::new(DirectoryCacheStore::new(&self.cache_dir)),
            self.artifacts(),
            RunSettings {
                branch: self.branch.clone(),
                revision: "4f2a9c1".to_string(),
                repository: None,
                source_dir: self.source.clone(),
                workspace_root: self.workspace.clone(),
                overrides: self.overrides.clone(),
                keep_workspace: self.keep_workspace,
            },
        )
    }

    /// Job workspace as laid out by the executor
    pub fn job_workspace(&self, result: &RunResult, job: &str) -> PathBuf {
        self.workspace
            .join(result.pipeline.state.execution_id.to_string())
            .join(job)
    }

    pub async fn run(&self, yaml: &str) -> RunResult {
        self.run_with(yaml, SchedulingStrategy::Sequential).await
    }

    pub async fn run_with(&self, yaml: &str, strategy: SchedulingStrategy) -> RunResult {
        let config = PipelineConfig::from_yaml(yaml).unwrap();
        let pipeline = config.to_pipeline(None).unwrap();
        self.run_pipeline(pipeline, strategy).await
    }

    pub async fn run_pipeline(&self, mut pipeline: Pipeline, strategy: SchedulingStrategy) -> RunResult {
        let engine = ExecutionEngine::new(self.executor(), strategy);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        engine.add_event_handler(move |event| sink.lock().unwrap().push(event));

        let status = engine.execute(&mut pipeline).await;
        let events = events.lock().unwrap().clone();

        RunResult {
            status,
            pipeline,
            events,
        }
    }
}

/// Outcome of a scenario run
pub struct RunResult {
    pub status: ExecutionStatus,
    pub pipeline: Pipeline,
    pub events: Vec<ExecutionEvent>,
}

impl RunResult {
    pub fn state(&self, job: &str) -> &JobState {
        &self
            .pipeline
            .job(job)
            .unwrap_or_else(|| panic!("job {} not in pipeline", job))
            .state
    }

    pub fn steps(&self, job: &str) -> &[StepResult] {
        self.state(job).step_results()
    }

    /// Step names with the given outcome
    pub fn steps_with(&self, job: &str, outcome: StepOutcome) -> Vec<String> {
        self.steps(job)
            .iter()
            .filter(|s| s.outcome == outcome)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Jobs in the order they started (retries repeat)
    pub fn start_order(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::JobStarted { job_id, .. } => Some(job_id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn summary(&self) -> String {
        let mut ids: Vec<&String> = self.pipeline.jobs.keys().collect();
        ids.sort();
        let jobs: Vec<String> = ids
            .into_iter()
            .map(|id| format!("{}={}", id, self.state(id).label()))
            .collect();
        format!("{:?}: {}", self.status, jobs.join(", "))
    }
}

pub fn assert_completed(result: &RunResult) {
    assert_eq!(
        result.status,
        ExecutionStatus::Completed,
        "pipeline should complete: {}",
        result.summary()
    );
}

pub fn assert_failed(result: &RunResult) {
    assert_eq!(
        result.status,
        ExecutionStatus::Failed,
        "pipeline should fail: {}",
        result.summary()
    );
}

/// Whether `path` exists under the directory
pub fn exists_under(dir: &Path, path: &str) -> bool {
    dir.join(path).exists()
}
