//! CLI output formatting

use crate::{
    core::{
        lint::{LintFinding, Severity},
        ExecutionStatus, JobState,
    },
    execution::ExecutionEvent,
    persistence::ExecutionSummary,
    runner::StreamKind,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static PACKAGE: Emoji<'_, '_> = Emoji("📦 ", "* ");

/// Create a progress bar over jobs
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    if let Ok(bar_style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        progress.set_style(bar_style.progress_chars("#>-"));
    }
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format a job state for display
pub fn format_job_state(state: &JobState) -> String {
    match state {
        JobState::Pending => style("PENDING").dim().to_string(),
        JobState::Retrying { attempt } => style(format!("RETRYING (attempt {})", attempt))
            .yellow()
            .to_string(),
        JobState::Running { attempt, .. } => {
            style(format!("RUNNING (attempt {})", attempt)).yellow().to_string()
        }
        JobState::Completed { .. } => style("COMPLETED").green().to_string(),
        JobState::Failed { .. } => style("FAILED").red().to_string(),
        JobState::Skipped { .. } => style("SKIPPED").dim().to_string(),
        JobState::Cancelled { .. } => style("CANCELLED").yellow().to_string(),
    }
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Completed => style("COMPLETED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
        ExecutionStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

/// Format execution summary for display
pub fn format_execution_summary(summary: &ExecutionSummary) -> String {
    let status_icon = match summary.status {
        ExecutionStatus::Completed => CHECK,
        ExecutionStatus::Failed => CROSS,
        ExecutionStatus::Running => SPINNER,
        _ => INFO,
    };

    format!(
        "{} {} - {} - {} ({}/{}) - {} {}",
        status_icon,
        style(short_id(&summary.execution_id.to_string())).dim(),
        style(&summary.pipeline_name).bold(),
        format_status(summary.status),
        summary.completed_jobs,
        summary.total_jobs,
        style(&summary.branch).cyan(),
        style(short_id(&summary.revision)).dim()
    )
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// Format a lint finding for display
pub fn format_finding(finding: &LintFinding) -> String {
    let (icon, severity) = match finding.severity {
        Severity::Error => (CROSS, style("error").red()),
        Severity::Warning => (WARN, style("warning").yellow()),
    };
    format!(
        "{}{} [{}] {}: {}",
        icon,
        severity,
        style(finding.rule).dim(),
        style(&finding.location).bold(),
        finding.message
    )
}

/// Format an execution event for display, `None` for events shown elsewhere
pub fn format_execution_event(event: &ExecutionEvent) -> Option<String> {
    let line = match event {
        ExecutionEvent::PipelineStarted {
            execution_id,
            pipeline_name,
            total_jobs,
        } => format!(
            "{} Starting pipeline {} ({}, {} jobs)",
            ROCKET,
            style(pipeline_name).bold(),
            style(short_id(&execution_id.to_string())).dim(),
            total_jobs
        ),
        ExecutionEvent::JobStarted { job_id, attempt } => {
            if *attempt > 1 {
                format!("{} {} (attempt {})", SPINNER, style(job_id).cyan(), attempt)
            } else {
                format!("{} {}", SPINNER, style(job_id).cyan())
            }
        }
        ExecutionEvent::JobRetrying {
            job_id,
            attempt,
            max_retries,
            error,
        } => format!(
            "{} {} failed, retrying ({}/{}): {}",
            WARN,
            style(job_id).yellow(),
            attempt - 1,
            max_retries,
            style(error).dim()
        ),
        ExecutionEvent::StepStarted { job_id, step, .. } => {
            format!("  {} {}", style(job_id).dim(), step)
        }
        ExecutionEvent::StepOutput { .. } => return None,
        ExecutionEvent::StepCompleted {
            job_id,
            step,
            duration_ms,
        } => format!(
            "  {}{} {} {}",
            CHECK,
            style(job_id).dim(),
            step,
            style(format_duration(Duration::from_millis(*duration_ms))).dim()
        ),
        ExecutionEvent::StepFailed { job_id, step, error } => format!(
            "  {}{} {}: {}",
            CROSS,
            style(job_id).dim(),
            style(step).red(),
            style(error).dim()
        ),
        ExecutionEvent::StepSkipped { job_id, step } => {
            format!("  {} {} {}", style(job_id).dim(), step, style("(skipped)").dim())
        }
        ExecutionEvent::CacheRestored {
            job_id,
            matched_key,
            ..
        } => format!(
            "  {}{} restored cache {}",
            PACKAGE,
            style(job_id).dim(),
            style(matched_key).green()
        ),
        ExecutionEvent::CacheMiss { job_id, .. } => {
            format!("  {}{} no cache found", PACKAGE, style(job_id).dim())
        }
        ExecutionEvent::CacheSaved {
            job_id,
            key,
            size_bytes,
        } => format!(
            "  {}{} saved cache {} ({} bytes)",
            PACKAGE,
            style(job_id).dim(),
            style(key).green(),
            size_bytes
        ),
        ExecutionEvent::ArtifactStored { job_id, path } => format!(
            "  {}{} stored {}",
            PACKAGE,
            style(job_id).dim(),
            style(path.display()).dim()
        ),
        ExecutionEvent::JobCompleted {
            job_id,
            duration_ms,
        } => format!(
            "{} {} {}",
            CHECK,
            style(job_id).green(),
            style(format_duration(Duration::from_millis(*duration_ms))).dim()
        ),
        ExecutionEvent::JobFailed { job_id, error } => {
            format!("{} {}: {}", CROSS, style(job_id).red(), style(error).dim())
        }
        ExecutionEvent::JobSkipped { job_id, reason } => {
            format!("{} {} skipped: {}", WARN, style(job_id).yellow(), style(reason).dim())
        }
        ExecutionEvent::PipelineCompleted {
            execution_id,
            status,
        } => format!(
            "{} Pipeline ({}) {}",
            INFO,
            style(short_id(&execution_id.to_string())).dim(),
            format_status(*status)
        ),
    };
    Some(line)
}

/// Format a streamed output line
pub fn format_output_line(job_id: &str, stream: StreamKind, line: &str) -> String {
    match stream {
        StreamKind::Stdout => format!("    {} {}", style(job_id).dim(), line),
        StreamKind::Stderr => format!("    {} {}", style(job_id).dim(), style(line).yellow()),
    }
}

/// Format step output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let tail = lines[lines.len() - max_lines..].join("\n");
        format!(
            "{}... ({} earlier lines)\n{}",
            style("[truncated]").dim(),
            lines.len() - max_lines,
            tail
        )
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
