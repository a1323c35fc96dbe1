//! Command runners for executing step scripts

pub mod config;
pub mod container;
pub mod output;
pub mod shell;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub use config::{ContainerEngine, RunnerConfig, RunnerKind};
pub use container::ContainerRunner;
pub use output::{CommandOutput, NoopSink, OutputSink, RunnerError, StreamKind};
pub use shell::ShellRunner;

/// A script to run for one step
#[derive(Debug, Clone)]
pub struct ShellCommand {
    /// Script passed verbatim to the shell
    pub script: String,

    /// Directory the script starts in
    pub working_dir: PathBuf,

    /// Job workspace root (mounted into containers)
    pub workspace: PathBuf,

    /// Full environment for the step
    pub env: HashMap<String, String>,

    /// Image the job runs in
    pub image: Option<String>,

    pub timeout_secs: u64,
}

impl ShellCommand {
    pub fn new(script: impl Into<String>, workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        Self {
            script: script.into(),
            working_dir: workspace.clone(),
            workspace,
            env: HashMap::new(),
            image: None,
            timeout_secs: 1800,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_image(mut self, image: Option<String>) -> Self {
        self.image = image;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// Trait for command execution - allows for different implementations
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a script, streaming output lines to the sink
    async fn run(
        &self,
        command: &ShellCommand,
        sink: Option<&dyn OutputSink>,
    ) -> Result<CommandOutput, RunnerError>;

    /// Short name for logs
    fn name(&self) -> &str;
}

/// Build the runner selected on the command line
pub fn from_config(kind: RunnerKind, config: RunnerConfig) -> Arc<dyn CommandRunner> {
    match kind {
        RunnerKind::Local => Arc::new(ShellRunner::new(config)),
        RunnerKind::Docker => Arc::new(ContainerRunner::new(ContainerEngine::Docker, config)),
        RunnerKind::Podman => Arc::new(ContainerRunner::new(ContainerEngine::Podman, config)),
    }
}
