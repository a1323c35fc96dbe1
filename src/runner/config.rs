//! Runner configuration

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Where step scripts run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    /// Directly on the host
    #[default]
    Local,
    Docker,
    Podman,
}

/// Container engine executable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEngine {
    Docker,
    Podman,
}

impl ContainerEngine {
    pub fn program(&self) -> &'static str {
        match self {
            ContainerEngine::Docker => "docker",
            ContainerEngine::Podman => "podman",
        }
    }
}

/// Configuration for command runners
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Shell used for step scripts
    pub shell: String,

    /// Upper bound on any single step (in seconds)
    pub max_timeout_secs: Option<u64>,

    /// Extra arguments for `docker run` / `podman run`
    pub container_args: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            max_timeout_secs: None,
            container_args: Vec::new(),
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.max_timeout_secs = Some(timeout_secs);
        self
    }

    pub fn with_container_arg(mut self, arg: impl Into<String>) -> Self {
        self.container_args.push(arg.into());
        self
    }

    /// Step timeout capped by the configured maximum
    pub fn effective_timeout(&self, step_timeout_secs: u64) -> u64 {
        match self.max_timeout_secs {
            Some(max) => step_timeout_secs.min(max),
            None => step_timeout_secs,
        }
    }

    /// Arguments that make the shell strict
    pub fn shell_args<'a>(&'a self, script: &'a str) -> [&'a str; 4] {
        ["-eo", "pipefail", "-c", script]
    }
}
