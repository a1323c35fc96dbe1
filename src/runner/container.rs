//! Container runner - runs step scripts inside the job image

use crate::runner::{
    shell::run_process, CommandOutput, CommandRunner, ContainerEngine, OutputSink, RunnerConfig,
    RunnerError, ShellCommand,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Mount point of the job workspace inside the container
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Runs each step in a fresh container with the workspace mounted
#[derive(Debug, Clone)]
pub struct ContainerRunner {
    engine: ContainerEngine,
    config: RunnerConfig,
}

impl ContainerRunner {
    pub fn new(engine: ContainerEngine, config: RunnerConfig) -> Self {
        Self { engine, config }
    }

    /// Arguments for `<engine> run`
    pub fn run_args(&self, command: &ShellCommand) -> Result<Vec<String>, RunnerError> {
        let image = command.image.as_deref().ok_or(RunnerError::MissingImage)?;
        let workspace = command.workspace.display().to_string();

        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:{}", workspace, CONTAINER_WORKSPACE),
            "-w".to_string(),
            to_container_path(&command.workspace, &command.working_dir),
        ];

        // Sorted for a stable command line
        let env: BTreeMap<_, _> = command.env.iter().collect();
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, rewrite_workspace(&workspace, value)));
        }

        args.extend(self.config.container_args.iter().cloned());
        args.push(image.to_string());
        args.push(self.config.shell.clone());
        args.extend(
            self.config
                .shell_args(&command.script)
                .iter()
                .map(|s| s.to_string()),
        );

        Ok(args)
    }
}

#[async_trait]
impl CommandRunner for ContainerRunner {
    async fn run(
        &self,
        command: &ShellCommand,
        sink: Option<&dyn OutputSink>,
    ) -> Result<CommandOutput, RunnerError> {
        let args = self.run_args(command)?;
        debug!(
            "{} run {}",
            self.engine.program(),
            command.image.as_deref().unwrap_or("")
        );

        let mut cmd = Command::new(self.engine.program());
        cmd.args(&args);

        run_process(
            cmd,
            self.engine.program(),
            self.config.effective_timeout(command.timeout_secs),
            sink,
        )
        .await
    }

    fn name(&self) -> &str {
        self.engine.program()
    }
}

fn to_container_path(workspace: &Path, dir: &Path) -> String {
    match dir.strip_prefix(workspace) {
        Ok(rel) if rel.as_os_str().is_empty() => CONTAINER_WORKSPACE.to_string(),
        Ok(rel) => format!("{}/{}", CONTAINER_WORKSPACE, rel.display()),
        Err(_) => dir.display().to_string(),
    }
}

/// Host workspace paths in values become container paths
fn rewrite_workspace(workspace: &str, value: &str) -> String {
    match value.strip_prefix(workspace) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => {
            format!("{}{}", CONTAINER_WORKSPACE, rest)
        }
        _ => value.to_string(),
    }
}
