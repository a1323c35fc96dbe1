//! cirun - run declarative CI job files locally or in containers

pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;
pub mod runner;

// Re-export commonly used types
pub use core::config::PipelineConfig;
pub use core::{ExecutionStatus, Job, JobContext, JobState, Pipeline, Step, StepKind};
pub use execution::{ExecutionEngine, ExecutionEvent, JobExecutor, RunSettings, SchedulingStrategy};
pub use persistence::{ArtifactStore, CacheStore, DirectoryCacheStore};
pub use runner::{CommandRunner, ShellCommand, ShellRunner};
