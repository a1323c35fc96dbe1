//! Job executor - runs the steps of one job in order

use crate::{
    core::{Job, JobContext, Step, StepKind, StepOutcome, StepResult},
    execution::events::{EventEmitter, ExecutionEvent},
    persistence::{ArtifactError, ArtifactStore, CacheStore, SaveOutcome},
    runner::{CommandRunner, OutputSink, RunnerError, ShellCommand, StreamKind},
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Settings shared by every job of a run
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub branch: String,
    pub revision: String,

    /// Git URL cloned by `checkout`
    pub repository: Option<String>,

    /// Local project copied by `checkout` when no repository is set
    pub source_dir: PathBuf,

    /// Parent of every job workspace
    pub workspace_root: PathBuf,

    /// Environment given on the command line
    pub overrides: HashMap<String, String>,

    /// Leave workspaces on disk after jobs finish
    pub keep_workspace: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            branch: String::new(),
            revision: String::new(),
            repository: None,
            source_dir: PathBuf::from("."),
            workspace_root: std::env::temp_dir().join("cirun"),
            overrides: HashMap::new(),
            keep_workspace: false,
        }
    }
}

/// Result of one job attempt
#[derive(Debug, Clone, Default)]
pub struct JobOutcome {
    pub steps: Vec<StepResult>,

    /// First failure, if any step failed
    pub error: Option<String>,

    /// Cancellation interrupted the job
    pub cancelled: bool,
}

impl JobOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.cancelled
    }
}

/// What a single step produced
struct StepRun {
    output: String,
    exit_code: Option<i32>,
    error: Option<String>,
}

impl StepRun {
    fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            exit_code: None,
            error: None,
        }
    }

    fn fail(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            output: error.clone(),
            exit_code: None,
            error: Some(error),
        }
    }
}

/// Forwards output lines as events
struct EventSink {
    job_id: String,
    events: EventEmitter,
}

impl OutputSink for EventSink {
    fn on_line(&self, stream: StreamKind, line: &str) {
        self.events.emit(ExecutionEvent::StepOutput {
            job_id: self.job_id.clone(),
            stream,
            line: line.to_string(),
        });
    }
}

/// Executes jobs
pub struct JobExecutor {
    runner: Arc<dyn CommandRunner>,
    cache: Arc<dyn CacheStore>,
    artifacts: ArtifactStore,
    settings: RunSettings,
    events: EventEmitter,
    cancelled: Arc<AtomicBool>,
}

impl JobExecutor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        cache: Arc<dyn CacheStore>,
        artifacts: ArtifactStore,
        settings: RunSettings,
    ) -> Self {
        Self {
            runner,
            cache,
            artifacts,
            settings,
            events: EventEmitter::default(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn with_events(mut self, events: EventEmitter, cancelled: Arc<AtomicBool>) -> Self {
        self.events = events;
        self.cancelled = cancelled;
        self
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Workspace directory for a job
    pub fn workspace_for(&self, execution_id: Uuid, job_id: &str) -> PathBuf {
        self.settings
            .workspace_root
            .join(execution_id.to_string())
            .join(job_id)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Build the context a job's steps run in
    pub fn job_context(
        &self,
        execution_id: Uuid,
        job: &Job,
        variables: &HashMap<String, String>,
    ) -> JobContext {
        JobContext::new(
            execution_id,
            job.id.clone(),
            self.workspace_for(execution_id, &job.id),
            job.working_directory.as_deref(),
        )
        .with_image(job.image.clone())
        .with_revision(self.settings.branch.clone(), self.settings.revision.clone())
        .with_environment(variables, &job.environment)
        .with_overrides(self.settings.overrides.clone())
    }

    /// Run every step of a job in a fresh workspace
    pub async fn execute(
        &self,
        execution_id: Uuid,
        job: &Job,
        variables: &HashMap<String, String>,
    ) -> JobOutcome {
        info!("Executing job: {}", job.id);

        let ctx = self.job_context(execution_id, job, variables);
        if let Err(e) = prepare_workspace(&ctx).await {
            error!("Failed to prepare workspace for {}: {}", job.id, e);
            return JobOutcome::failed(format!("Failed to prepare workspace: {}", e));
        }

        let deadline = job
            .timeout_secs
            .map(|secs| (Instant::now() + Duration::from_secs(secs), secs));
        let mut outcome = JobOutcome::default();

        for (index, step) in job.steps.iter().enumerate() {
            if self.is_cancelled() {
                warn!("Job {} cancelled before step '{}'", job.id, step.name);
                outcome.cancelled = true;
                break;
            }

            let failed = outcome.error.is_some();
            if !step.when.should_run(failed) {
                debug!("Skipping step '{}' in {}", step.name, job.id);
                self.events.emit(ExecutionEvent::StepSkipped {
                    job_id: job.id.clone(),
                    step: step.name.clone(),
                });
                outcome.steps.push(StepResult {
                    name: step.name.clone(),
                    outcome: StepOutcome::Skipped,
                    exit_code: None,
                    output: String::new(),
                    duration_ms: 0,
                });
                continue;
            }

            let timeout_secs = match deadline {
                Some((at, secs)) => {
                    let remaining = at.saturating_duration_since(Instant::now()).as_secs();
                    if remaining == 0 {
                        outcome
                            .error
                            .get_or_insert_with(|| format!("Job timed out after {} seconds", secs));
                        break;
                    }
                    step.timeout_secs.min(remaining)
                }
                None => step.timeout_secs,
            };

            self.events.emit(ExecutionEvent::StepStarted {
                job_id: job.id.clone(),
                step: step.name.clone(),
                index,
            });

            let started = Instant::now();
            let run = self.run_step(step, &ctx, timeout_secs).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let step_outcome = match &run.error {
                None => {
                    self.events.emit(ExecutionEvent::StepCompleted {
                        job_id: job.id.clone(),
                        step: step.name.clone(),
                        duration_ms,
                    });
                    StepOutcome::Success
                }
                Some(err) => {
                    error!("Step '{}' in {} failed: {}", step.name, job.id, err);
                    self.events.emit(ExecutionEvent::StepFailed {
                        job_id: job.id.clone(),
                        step: step.name.clone(),
                        error: err.clone(),
                    });
                    outcome
                        .error
                        .get_or_insert_with(|| format!("Step '{}' failed: {}", step.name, err));
                    StepOutcome::Failed
                }
            };

            outcome.steps.push(StepResult {
                name: step.name.clone(),
                outcome: step_outcome,
                exit_code: run.exit_code,
                output: run.output,
                duration_ms,
            });

            if self.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
        }

        if !self.settings.keep_workspace {
            if let Err(e) = tokio::fs::remove_dir_all(&ctx.workspace).await {
                debug!("Could not remove workspace {}: {}", ctx.workspace.display(), e);
            }
        }

        outcome
    }

    async fn run_step(&self, step: &Step, ctx: &JobContext, timeout_secs: u64) -> StepRun {
        match &step.kind {
            StepKind::Checkout => self.checkout(ctx, timeout_secs).await,
            StepKind::RestoreCache { keys } => self.restore_cache(ctx, keys).await,
            StepKind::SaveCache { key, paths } => self.save_cache(ctx, key, paths).await,
            StepKind::Run {
                command,
                environment,
                working_directory,
            } => {
                let dir = working_directory
                    .as_deref()
                    .map(|d| ctx.resolve_path(d))
                    .unwrap_or_else(|| ctx.working_dir.clone());
                self.run_command(ctx, command, environment, &dir, timeout_secs)
                    .await
            }
            StepKind::StoreArtifacts { path, destination } => {
                let source = ctx.resolve_path(path);
                let stored = self
                    .artifacts
                    .store(ctx.execution_id, &ctx.job_id, &source, destination.as_deref())
                    .await;
                self.artifact_result(ctx, stored)
            }
            StepKind::StoreTestResults { path } => {
                let source = ctx.resolve_path(path);
                let stored = self
                    .artifacts
                    .store_test_results(ctx.execution_id, &ctx.job_id, &source)
                    .await;
                self.artifact_result(ctx, stored)
            }
            StepKind::UploadCoverage {
                file,
                uploader,
                flags,
                token_env,
            } => {
                self.upload_coverage(ctx, file, uploader, flags, token_env.as_deref(), timeout_secs)
                    .await
            }
        }
    }

    async fn run_command(
        &self,
        ctx: &JobContext,
        script: &str,
        environment: &HashMap<String, String>,
        dir: &Path,
        timeout_secs: u64,
    ) -> StepRun {
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            return StepRun::fail(format!("Cannot create {}: {}", dir.display(), e));
        }

        let command = ShellCommand::new(script, &ctx.workspace)
            .with_working_dir(dir)
            .with_env(ctx.step_environment(environment))
            .with_image(ctx.image.clone())
            .with_timeout(timeout_secs);
        let sink = EventSink {
            job_id: ctx.job_id.clone(),
            events: self.events.clone(),
        };

        let result = tokio::select! {
            r = self.runner.run(&command, Some(&sink)) => r,
            _ = wait_for_cancel(&self.cancelled) => {
                return StepRun::fail("Cancelled");
            }
        };

        match result {
            Ok(output) if output.success() => StepRun {
                output: output.combined(),
                exit_code: Some(0),
                error: None,
            },
            Ok(output) => StepRun {
                output: output.combined(),
                exit_code: Some(output.exit_code),
                error: Some(format!("Exited with code {}", output.exit_code)),
            },
            Err(RunnerError::Timeout(secs)) => StepRun::fail(format!("Timeout after {} seconds", secs)),
            Err(e) => StepRun::fail(e.to_string()),
        }
    }

    async fn checkout(&self, ctx: &JobContext, timeout_secs: u64) -> StepRun {
        if let Some(url) = &self.settings.repository {
            let script = clone_script(url, &ctx.branch);
            return self
                .run_command(ctx, &script, &HashMap::new(), &ctx.working_dir, timeout_secs)
                .await;
        }

        let source = self.settings.source_dir.clone();
        let target = ctx.working_dir.clone();
        let workspace_root = self.settings.workspace_root.clone();
        let copied = tokio::task::spawn_blocking(move || copy_source(&source, &target, &workspace_root))
            .await;

        match copied {
            Ok(Ok(files)) => StepRun::ok(format!(
                "Copied {} entries from {} to {}",
                files,
                self.settings.source_dir.display(),
                ctx.working_dir.display()
            )),
            Ok(Err(e)) => StepRun::fail(format!("Checkout failed: {}", e)),
            Err(e) => StepRun::fail(format!("Checkout task failed: {}", e)),
        }
    }

    async fn restore_cache(&self, ctx: &JobContext, keys: &[crate::core::CacheKeyTemplate]) -> StepRun {
        let key_ctx = ctx.key_context();
        let mut tried = Vec::new();

        for template in keys {
            let key = match template.render(&key_ctx) {
                Ok(k) => k,
                Err(e) => {
                    warn!("Skipping cache key '{}': {}", template.as_str(), e);
                    continue;
                }
            };
            tried.push(key.clone());

            let entry = match self.cache.find(&key).await {
                Ok(Some(entry)) => entry,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Cache lookup for '{}' failed: {}", key, e);
                    continue;
                }
            };

            let destinations: Vec<PathBuf> = entry.paths.iter().map(|p| ctx.resolve_path(p)).collect();
            match self.cache.restore(&entry, &destinations).await {
                Ok(bytes) => {
                    info!("Restored cache {} for {} ({} bytes)", entry.key, ctx.job_id, bytes);
                    self.events.emit(ExecutionEvent::CacheRestored {
                        job_id: ctx.job_id.clone(),
                        key: key.clone(),
                        matched_key: entry.key.clone(),
                    });
                    return StepRun::ok(format!("Found a cache at key {}", entry.key));
                }
                Err(e) => {
                    warn!("Restoring cache {} failed: {}", entry.key, e);
                }
            }
        }

        self.events.emit(ExecutionEvent::CacheMiss {
            job_id: ctx.job_id.clone(),
            keys: tried,
        });
        StepRun::ok("No cache found")
    }

    async fn save_cache(
        &self,
        ctx: &JobContext,
        template: &crate::core::CacheKeyTemplate,
        paths: &[String],
    ) -> StepRun {
        let key = match template.render(&ctx.key_context()) {
            Ok(k) => k,
            Err(e) => return StepRun::fail(format!("Cannot render cache key: {}", e)),
        };

        let sources: Vec<(String, PathBuf)> = paths
            .iter()
            .map(|p| (p.clone(), ctx.resolve_path(p)))
            .collect();

        match self.cache.save(&key, &sources).await {
            Ok(SaveOutcome::Saved { size_bytes }) => {
                self.events.emit(ExecutionEvent::CacheSaved {
                    job_id: ctx.job_id.clone(),
                    key: key.clone(),
                    size_bytes,
                });
                StepRun::ok(format!("Stored cache {} ({} bytes)", key, size_bytes))
            }
            Ok(SaveOutcome::AlreadyExists) => StepRun::ok(format!(
                "Skipping cache generation, cache already exists for key: {}",
                key
            )),
            Ok(SaveOutcome::NothingToSave) => {
                warn!("No cache paths exist for key {}", key);
                StepRun::ok(format!("No paths to cache for key {}", key))
            }
            Err(e) => StepRun::fail(format!("Saving cache failed: {}", e)),
        }
    }

    fn artifact_result(
        &self,
        ctx: &JobContext,
        stored: Result<crate::persistence::StoredArtifact, ArtifactError>,
    ) -> StepRun {
        match stored {
            Ok(artifact) => {
                self.events.emit(ExecutionEvent::ArtifactStored {
                    job_id: ctx.job_id.clone(),
                    path: artifact.destination.clone(),
                });
                StepRun::ok(format!("Uploaded {}", artifact.destination.display()))
            }
            Err(ArtifactError::NotFound(path)) => {
                warn!("No artifact files found at {}", path.display());
                StepRun::ok(format!("No artifact files found at {}", path.display()))
            }
            Err(e) => StepRun::fail(e.to_string()),
        }
    }

    async fn upload_coverage(
        &self,
        ctx: &JobContext,
        file: &str,
        uploader: &str,
        flags: &[String],
        token_env: Option<&str>,
        timeout_secs: u64,
    ) -> StepRun {
        let report = ctx.resolve_path(file);
        if !report.is_file() {
            return StepRun::fail(format!("Coverage report {} not found", report.display()));
        }

        let mut script = format!("{} -f {}", uploader, script_path(ctx, &report));
        for flag in flags {
            script.push_str(&format!(" -F {}", shell_quote(flag)));
        }

        if let Some(name) = token_env {
            let env = ctx.step_environment(&HashMap::new());
            if env.get(name).is_some_and(|v| !v.is_empty()) {
                script.push_str(&format!(" -t \"${}\"", name));
            } else {
                warn!("Coverage token variable {} is not set", name);
            }
        }

        self.run_command(ctx, &script, &HashMap::new(), &ctx.working_dir, timeout_secs)
            .await
    }
}

/// Create the workspace, working directory and an empty environment file
async fn prepare_workspace(ctx: &JobContext) -> std::io::Result<()> {
    if tokio::fs::try_exists(&ctx.workspace).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(&ctx.workspace).await?;
    }
    tokio::fs::create_dir_all(&ctx.working_dir).await?;
    tokio::fs::write(ctx.env_file(), "").await?;
    Ok(())
}

async fn wait_for_cancel(flag: &AtomicBool) {
    while !flag.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Copy the project into the working directory, leaving out the workspace root
fn copy_source(source: &Path, target: &Path, workspace_root: &Path) -> std::io::Result<usize> {
    let workspace_root = workspace_root
        .canonicalize()
        .unwrap_or_else(|_| workspace_root.to_path_buf());
    let mut copied = 0;

    for item in std::fs::read_dir(source)? {
        let item = item?;
        let path = item.path();
        let resolved = path.canonicalize().unwrap_or_else(|_| path.clone());
        if workspace_root.starts_with(&resolved) {
            continue;
        }
        crate::persistence::cache::copy_tree(&path, &target.join(item.file_name()))?;
        copied += 1;
    }

    Ok(copied)
}

/// Fetch a repository into the current directory, which may already hold files
fn clone_script(url: &str, branch: &str) -> String {
    let mut script = format!("git init -q . && git remote add origin {}", shell_quote(url));
    if branch.is_empty() {
        script.push_str(" && git fetch -q --depth 1 origin HEAD && git checkout -q FETCH_HEAD");
    } else {
        let branch = shell_quote(branch);
        script.push_str(&format!(
            " && git fetch -q --depth 1 origin {} && git checkout -q -B {} FETCH_HEAD",
            branch, branch
        ));
    }
    script
}

/// A path as a step script run from the working directory should name it
///
/// Host workspace paths do not exist inside a container, so paths under the
/// workspace stay relative to the working directory or `$HOME`.
fn script_path(ctx: &JobContext, path: &Path) -> String {
    if let Ok(rel) = path.strip_prefix(&ctx.working_dir) {
        return shell_quote(&rel.display().to_string());
    }
    if let Ok(rel) = path.strip_prefix(&ctx.workspace) {
        return format!("\"$HOME\"/{}", shell_quote(&rel.display().to_string()));
    }
    shell_quote(&path.display().to_string())
}

/// Quote a value for `bash -c`
pub(crate) fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
