//! Command-line interface

pub mod commands;
pub mod git;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{
    CacheCommand, CacheKeyCommand, HistoryCommand, ListCommand, PlanCommand, RunCommand,
    ValidateCommand,
};
use std::ffi::OsString;

/// Declarative CI job runner
#[derive(Debug, Parser, Clone)]
#[command(name = "cirun")]
#[command(version)]
#[command(about = "Run CI job files locally or in containers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a pipeline
    Run(RunCommand),

    /// Validate and lint a job file
    Validate(ValidateCommand),

    /// Show expanded jobs, order and matrix groups
    Plan(PlanCommand),

    /// Render the cache keys of a job
    CacheKey(CacheKeyCommand),

    /// Inspect or clear the dependency cache
    Cache(CacheCommand),

    /// List pipelines in history
    List(ListCommand),

    /// Show execution history
    History(HistoryCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
