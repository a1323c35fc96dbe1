//! CLI command definitions

use crate::execution::SchedulingStrategy;
use crate::runner::RunnerKind;
use clap::{Args, Subcommand};
use std::path::PathBuf;

/// Run a pipeline
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to the job file
    #[arg(short, long, default_value = ".cirun.yml")]
    pub file: PathBuf,

    /// Workflow to run (all workflows when omitted)
    #[arg(short, long)]
    pub workflow: Option<String>,

    /// Only run these jobs and the jobs they require
    #[arg(short, long = "job")]
    pub jobs: Vec<String>,

    /// Branch name (detected with git when omitted)
    #[arg(long)]
    pub branch: Option<String>,

    /// Revision (detected with git when omitted)
    #[arg(long)]
    pub revision: Option<String>,

    /// Project directory copied by `checkout`
    #[arg(long, default_value = ".")]
    pub source: PathBuf,

    /// Directory holding job workspaces
    #[arg(long, env = "CIRUN_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Dependency cache directory
    #[arg(long, env = "CIRUN_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Artifact directory
    #[arg(long, env = "CIRUN_ARTIFACTS_DIR")]
    pub artifacts_dir: Option<PathBuf>,

    /// Where step commands run
    #[arg(long, value_enum, default_value_t = RunnerKind::Local)]
    pub runner: RunnerKind,

    /// Scheduling strategy
    #[arg(long, value_enum, default_value_t = SchedulingStrategyArg::Sequential)]
    pub strategy: SchedulingStrategyArg,

    /// Concurrent jobs for `parallel-limited`
    #[arg(long, default_value_t = 4)]
    pub max_parallel: usize,

    /// Environment overrides (key=value)
    #[arg(long = "var", value_parser = parse_key_value)]
    pub variables: Vec<(String, String)>,

    /// Don't save execution to history
    #[arg(long)]
    pub no_history: bool,

    /// Leave job workspaces on disk
    #[arg(long)]
    pub keep_workspace: bool,

    /// Print step output as it arrives
    #[arg(short, long)]
    pub stream: bool,
}

impl RunCommand {
    pub fn scheduling_strategy(&self) -> SchedulingStrategy {
        match self.strategy {
            SchedulingStrategyArg::Sequential => SchedulingStrategy::Sequential,
            SchedulingStrategyArg::Parallel => SchedulingStrategy::Parallel,
            SchedulingStrategyArg::ParallelLimited => {
                SchedulingStrategy::LimitedParallel(self.max_parallel)
            }
        }
    }
}

/// Validate a job file
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to the job file
    #[arg(short, long, default_value = ".cirun.yml")]
    pub file: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Treat lint warnings as errors
    #[arg(long)]
    pub strict: bool,
}

/// Show expanded jobs and their order
#[derive(Debug, Args, Clone)]
pub struct PlanCommand {
    /// Path to the job file
    #[arg(short, long, default_value = ".cirun.yml")]
    pub file: PathBuf,

    /// Workflow to plan
    #[arg(short, long)]
    pub workflow: Option<String>,
}

/// Render cache keys for a job
#[derive(Debug, Args, Clone)]
pub struct CacheKeyCommand {
    /// Path to the job file
    #[arg(short, long, default_value = ".cirun.yml")]
    pub file: PathBuf,

    /// Job to render keys for
    #[arg(short, long)]
    pub job: String,

    /// Branch name (detected with git when omitted)
    #[arg(long)]
    pub branch: Option<String>,

    /// Directory checksummed files are read from
    #[arg(long, default_value = ".")]
    pub source: PathBuf,
}

/// Manage the dependency cache
#[derive(Debug, Args, Clone)]
pub struct CacheCommand {
    #[command(subcommand)]
    pub action: CacheAction,

    /// Dependency cache directory
    #[arg(long, global = true, env = "CIRUN_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum CacheAction {
    /// List cache entries
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Remove every cache entry
    Clear,
}

/// List pipelines in history
#[derive(Debug, Args, Clone)]
pub struct ListCommand {
    /// Show execution counts
    #[arg(long)]
    pub with_counts: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show execution history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent executions to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Show full details
    #[arg(long)]
    pub verbose: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show a specific execution
    #[arg(long)]
    pub execution_id: Option<String>,
}

/// Scheduling strategy argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SchedulingStrategyArg {
    Sequential,
    Parallel,
    #[clap(name = "parallel-limited")]
    ParallelLimited,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("PYTHONPATH=/opt/lib=x").unwrap(),
            ("PYTHONPATH".to_string(), "/opt/lib=x".to_string())
        );
        assert_eq!(
            parse_key_value("EMPTY=").unwrap(),
            ("EMPTY".to_string(), String::new())
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }
}
