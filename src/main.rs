use anyhow::{bail, Context, Result};
use cirun::cli::commands::{
    CacheAction, CacheCommand, CacheKeyCommand, HistoryCommand, ListCommand, PlanCommand,
    RunCommand, ValidateCommand,
};
use cirun::cli::output::*;
use cirun::cli::{git, Cli, Command};
use cirun::core::config::PipelineConfig;
use cirun::core::{lint, matrix, ExecutionStatus, JobContext, Step, StepKind};
use cirun::execution::{ExecutionEngine, ExecutionEvent, JobExecutor, RunSettings};
use cirun::persistence::{
    create_summary, ArtifactStore, CacheStore, DirectoryCacheStore, ExecutionSummary,
    InMemoryPersistence, PersistenceBackend,
};
use cirun::runner::{self, RunnerConfig};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    // Execute command
    match &cli.command {
        Command::Run(cmd) => run_pipeline(cmd).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::Plan(cmd) => plan_pipeline(cmd)?,
        Command::CacheKey(cmd) => show_cache_keys(cmd).await?,
        Command::Cache(cmd) => manage_cache(cmd).await?,
        Command::List(cmd) => list_pipelines(cmd).await?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

#[cfg(feature = "sqlite")]
async fn open_history() -> Result<Arc<dyn PersistenceBackend>> {
    Ok(Arc::new(
        cirun::persistence::SqliteExecutionStore::with_default_path().await?,
    ))
}

#[cfg(not(feature = "sqlite"))]
async fn open_history() -> Result<Arc<dyn PersistenceBackend>> {
    warn!("Built without sqlite; history is not persisted");
    Ok(Arc::new(InMemoryPersistence::new()))
}

fn cache_store(dir: &Option<PathBuf>) -> DirectoryCacheStore {
    match dir {
        Some(dir) => DirectoryCacheStore::new(dir),
        None => DirectoryCacheStore::with_default_path(),
    }
}

async fn run_pipeline(cmd: &RunCommand) -> Result<()> {
    // Load pipeline config
    let config = PipelineConfig::from_file(&cmd.file).context("Failed to load job file")?;

    println!("{} Loaded pipeline: {}", INFO, style(&config.name).bold());

    let mut pipeline = config.to_pipeline(cmd.workflow.as_deref())?;
    pipeline.select_jobs(&cmd.jobs)?;

    let source_dir = cmd
        .source
        .canonicalize()
        .with_context(|| format!("Source directory {} not found", cmd.source.display()))?;
    let branch = match &cmd.branch {
        Some(b) => b.clone(),
        None => git::detect_branch(&source_dir).await.unwrap_or_default(),
    };
    let revision = match &cmd.revision {
        Some(r) => r.clone(),
        None => git::detect_revision(&source_dir).await.unwrap_or_default(),
    };

    for (key, value) in &cmd.variables {
        println!(
            "{} Variable override: {} = {}",
            INFO,
            style(key).cyan(),
            style(value).dim()
        );
    }

    let settings = RunSettings {
        branch: branch.clone(),
        revision: revision.clone(),
        repository: pipeline.repository.clone(),
        source_dir,
        workspace_root: cmd
            .workspace
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("cirun")),
        overrides: cmd.variables.iter().cloned().collect(),
        keep_workspace: cmd.keep_workspace,
    };

    // Set up persistence
    let store: Arc<dyn PersistenceBackend> = if cmd.no_history {
        Arc::new(InMemoryPersistence::new())
    } else {
        open_history().await?
    };

    let artifacts = match &cmd.artifacts_dir {
        Some(dir) => ArtifactStore::new(dir),
        None => ArtifactStore::with_default_path(),
    };
    let runner = runner::from_config(cmd.runner, RunnerConfig::default());
    let cache: Arc<dyn CacheStore> = Arc::new(cache_store(&cmd.cache_dir));
    let executor = JobExecutor::new(runner, cache, artifacts.clone(), settings);

    // Create execution engine
    let engine = ExecutionEngine::new(executor, cmd.scheduling_strategy());

    // Set up event handler for console output
    let progress = create_progress_bar(pipeline.jobs.len());
    let stream = cmd.stream;
    let bar = progress.clone();
    engine.add_event_handler(move |event| {
        if let ExecutionEvent::StepOutput {
            job_id,
            stream: kind,
            line,
        } = &event
        {
            if stream {
                bar.println(format_output_line(job_id, *kind, line));
            }
            return;
        }

        if let Some(line) = format_execution_event(&event) {
            bar.println(line);
        }
        match &event {
            ExecutionEvent::JobStarted { job_id, .. } => bar.set_message(job_id.clone()),
            ExecutionEvent::JobCompleted { .. }
            | ExecutionEvent::JobFailed { .. }
            | ExecutionEvent::JobSkipped { .. } => bar.inc(1),
            _ => {}
        }
    });

    let cancel = engine.cancellation_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling pipeline");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    // Execute pipeline
    println!();
    let status = engine.execute(&mut pipeline).await;
    progress.finish_and_clear();

    // Show the tail of each failed job's output
    for job in pipeline.jobs.values() {
        if let cirun::core::JobState::Failed { steps, error, .. } = &job.state {
            println!("\n{} {}: {}", CROSS, style(&job.id).red().bold(), error);
            if let Some(step) = steps.iter().rev().find(|s| !s.output.is_empty()) {
                println!("{}", format_output(&step.output, 20));
            }
        }
    }

    // Save to history
    if !cmd.no_history {
        let summary = create_summary(&pipeline, &branch, &revision);
        store.save_execution(&summary).await?;
        println!(
            "\n{} Execution saved to history (ID: {})",
            INFO,
            style(&summary.execution_id.to_string()[..8]).dim()
        );
    }
    println!(
        "{} Artifacts: {}",
        INFO,
        style(artifacts.root().join(pipeline.state.execution_id.to_string()).display()).dim()
    );

    // Print final status
    match status {
        ExecutionStatus::Completed => {
            println!(
                "\n{} {} completed {}",
                CHECK,
                style(&pipeline.name).bold(),
                style("successfully").green()
            );
            Ok(())
        }
        other => {
            println!(
                "\n{} {} {}",
                CROSS,
                style(&pipeline.name).bold(),
                format_status(other)
            );
            error!(
                "{} of {} jobs failed, {} skipped",
                pipeline.state.failed_jobs, pipeline.state.total_jobs, pipeline.state.skipped_jobs
            );
            std::process::exit(1);
        }
    }
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<()> {
    let config = match PipelineConfig::from_file(&cmd.file) {
        Ok(config) => config,
        Err(e) => {
            if cmd.json {
                let data = serde_json::json!({ "valid": false, "error": format!("{:#}", e) });
                println!("{}", serde_json::to_string_pretty(&data)?);
            } else {
                println!("{} Validation failed:", CROSS);
                println!("  {}", style(format!("{:#}", e)).red());
            }
            std::process::exit(1);
        }
    };

    let findings = lint::lint(&config);
    let failed = lint::has_errors(&findings, cmd.strict);

    if cmd.json {
        let jobs: Vec<String> = config.expand_jobs()?.into_iter().map(|j| j.name).collect();
        let data = serde_json::json!({
            "valid": !failed,
            "name": config.name,
            "jobs": jobs,
            "findings": findings,
        });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{} Validating {}...", INFO, style(cmd.file.display()).dim());
        println!("  Name: {}", style(&config.name).bold());
        println!("  Jobs: {}", style(config.jobs.len()).cyan());
        println!("  Variables: {}", style(config.variable_count()).cyan());
        for finding in &findings {
            println!("  {}", format_finding(finding));
        }
        if failed {
            println!("{} Validation failed", CROSS);
        } else {
            println!("{} Job file is valid!", CHECK);
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn plan_pipeline(cmd: &PlanCommand) -> Result<()> {
    let config = PipelineConfig::from_file(&cmd.file).context("Failed to load job file")?;
    let pipeline = config.to_pipeline(cmd.workflow.as_deref())?;

    println!(
        "{} Plan for {} ({})",
        INFO,
        style(&pipeline.name).bold(),
        cmd.workflow.as_deref().unwrap_or("all workflows")
    );

    for (index, id) in pipeline.execution_order().iter().enumerate() {
        let Some(job) = pipeline.job(id) else {
            continue;
        };
        let mut line = format!("  {}. {}", index + 1, style(id).cyan());
        if let Some(image) = &job.image {
            line.push_str(&format!(" [{}]", style(image).dim()));
        }
        if !job.requires.is_empty() {
            line.push_str(&format!(" requires {}", job.requires.join(", ")));
        }
        println!("{}", line);
        for step in &job.steps {
            println!("       - {}", step.name);
        }
    }

    let expanded = config.expand_jobs()?;
    let groups = matrix::matrix_groups(&expanded);
    if !groups.is_empty() {
        println!("\n{} Template groups:", INFO);
        for group in groups {
            let marker = if group.differs_only_by_image() { CHECK } else { WARN };
            println!(
                "  {}{}: {}",
                marker,
                style(&group.template).bold(),
                group.images().join(", ")
            );
        }
    }

    Ok(())
}

async fn show_cache_keys(cmd: &CacheKeyCommand) -> Result<()> {
    let config = PipelineConfig::from_file(&cmd.file).context("Failed to load job file")?;
    let expanded = config.expand_jobs()?;
    let Some(job) = expanded.iter().find(|j| j.name == cmd.job) else {
        bail!("Job '{}' not found", cmd.job);
    };

    let source_dir = cmd
        .source
        .canonicalize()
        .with_context(|| format!("Source directory {} not found", cmd.source.display()))?;
    let branch = match &cmd.branch {
        Some(b) => b.clone(),
        None => git::detect_branch(&source_dir).await.unwrap_or_default(),
    };
    let revision = git::detect_revision(&source_dir).await.unwrap_or_default();

    // Checked-out files live in the working directory, which is the source here
    let mut ctx = JobContext::new(Uuid::nil(), job.name.clone(), &source_dir, None)
        .with_image(job.image.clone())
        .with_revision(branch, revision)
        .with_environment(&config.variables_as_string_map()?, &job.environment);
    ctx.working_dir = source_dir.clone();
    let key_ctx = ctx.key_context();

    let defaults = config.step_defaults();
    for step_config in &job.steps {
        let step = Step::from_config(step_config, &defaults)?;
        let templates = match &step.kind {
            StepKind::RestoreCache { keys } => keys.iter().collect::<Vec<_>>(),
            StepKind::SaveCache { key, .. } => vec![key],
            _ => continue,
        };

        println!("{} {}", INFO, style(&step.name).bold());
        for template in templates {
            match template.render(&key_ctx) {
                Ok(key) => println!("  {} -> {}", style(template.as_str()).dim(), style(key).green()),
                Err(e) => println!("  {} -> {}", style(template.as_str()).dim(), style(e).red()),
            }
        }
    }

    Ok(())
}

async fn manage_cache(cmd: &CacheCommand) -> Result<()> {
    let store = cache_store(&cmd.cache_dir);

    match &cmd.action {
        CacheAction::List { json } => {
            let entries = store.list().await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                println!("{} Cache at {} is empty", INFO, style(store.root().display()).dim());
            } else {
                println!("{} Cache entries in {}:", INFO, style(store.root().display()).dim());
                for entry in entries {
                    println!(
                        "  {} {} {} bytes ({})",
                        style(&entry.key).bold(),
                        style(entry.created_at.to_rfc3339()).dim(),
                        entry.size_bytes,
                        entry.paths.join(", ")
                    );
                }
            }
        }
        CacheAction::Clear => {
            let removed = store.clear().await?;
            println!("{} Removed {} cache entries", CHECK, removed);
        }
    }

    Ok(())
}

async fn list_pipelines(cmd: &ListCommand) -> Result<()> {
    let store = open_history().await?;
    let pipelines = store.list_pipelines().await?;

    if pipelines.is_empty() {
        println!("{} No pipelines found in history", INFO);
        return Ok(());
    }

    if cmd.json {
        let mut json_data = Vec::new();
        for pipeline in &pipelines {
            let executions = store.list_executions(pipeline).await?;
            json_data.push(serde_json::json!({
                "name": pipeline,
                "execution_count": executions.len()
            }));
        }
        let data = serde_json::json!({ "pipelines": json_data });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    println!("{} Pipelines in history:", INFO);

    for pipeline_name in &pipelines {
        if cmd.with_counts {
            let executions = store.list_executions(pipeline_name).await?;
            let completed = executions
                .iter()
                .filter(|e| e.status == ExecutionStatus::Completed)
                .count();
            let failed = executions
                .iter()
                .filter(|e| e.status == ExecutionStatus::Failed)
                .count();
            println!(
                "  {} ({} runs: {} succeeded, {} failed)",
                style(pipeline_name).bold(),
                style(executions.len()).cyan(),
                style(completed).green(),
                style(failed).red()
            );
        } else {
            println!("  {}", style(pipeline_name).bold());
        }
    }

    Ok(())
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = open_history().await?;

    if let Some(exec_id_str) = &cmd.execution_id {
        let exec_id = Uuid::parse_str(exec_id_str).context("Invalid execution ID format")?;
        match store.load_execution(exec_id).await? {
            Some(summary) => print_execution_details(&summary, cmd.verbose)?,
            None => println!("{} Execution not found", WARN),
        }
        return Ok(());
    }

    let mut executions = if let Some(pipeline_name) = &cmd.pipeline {
        store.list_executions(pipeline_name).await?
    } else {
        let mut all_execs = Vec::new();
        for pipeline in store.list_pipelines().await? {
            all_execs.extend(store.list_executions(&pipeline).await?);
        }
        all_execs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all_execs
    };
    executions.truncate(cmd.limit);

    if cmd.json {
        let data = serde_json::json!({ "executions": executions });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if executions.is_empty() {
        println!("{} No executions found", INFO);
        return Ok(());
    }

    println!("{} Execution history (showing latest {}):", INFO, cmd.limit);
    for summary in &executions {
        println!("  {}", format_execution_summary(summary));
    }

    Ok(())
}

fn print_execution_details(summary: &ExecutionSummary, verbose: bool) -> Result<()> {
    println!("{} Execution Details", INFO);
    println!("  ID: {}", style(summary.execution_id).cyan());
    println!("  Pipeline: {}", style(&summary.pipeline_name).bold());
    println!("  Branch: {} ({})", style(&summary.branch).cyan(), style(&summary.revision).dim());
    println!("  Status: {}", format_status(summary.status));
    println!("  Started: {}", style(summary.started_at.to_rfc3339()).dim());
    if let Some(completed) = summary.completed_at {
        println!("  Completed: {}", style(completed.to_rfc3339()).dim());
        if let Ok(duration) = completed.signed_duration_since(summary.started_at).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    println!(
        "  Progress: {} ({}/{}, {} failed, {} skipped)",
        style(format!("{:.0}%", summary.progress * 100.0)).cyan(),
        summary.completed_jobs,
        summary.total_jobs,
        summary.failed_jobs,
        summary.skipped_jobs
    );

    println!("  Jobs:");
    for job in &summary.jobs {
        let mut line = format!("    {} {}", style(&job.job_id).bold(), job.status);
        if job.attempts > 1 {
            line.push_str(&format!(" after {} attempts", job.attempts));
        }
        if let Some(ms) = job.duration_ms {
            line.push_str(&format!(
                " in {}",
                format_duration(std::time::Duration::from_millis(ms))
            ));
        }
        if let Some(message) = &job.message {
            line.push_str(&format!(": {}", style(message).dim()));
        }
        println!("{}", line);
    }

    if verbose {
        println!("\n  {}", style("Full details:").bold());
        let json = serde_json::to_string_pretty(summary)?;
        for line in json.lines() {
            println!("    {}", line);
        }
    }

    Ok(())
}
