//! Step domain model

use crate::core::{
    cache_key::CacheKeyTemplate,
    config::{StepConfig, StepSpec},
};
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Default uploader executable for coverage reports
pub const DEFAULT_COVERAGE_UPLOADER: &str = "codecov";

/// When a step runs relative to earlier failures in the same job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum When {
    /// Only while every earlier step succeeded
    #[default]
    OnSuccess,
    /// Only after an earlier step failed
    OnFail,
    /// Regardless of earlier failures
    Always,
}

impl When {
    pub fn should_run(&self, job_failed: bool) -> bool {
        match self {
            When::OnSuccess => !job_failed,
            When::OnFail => job_failed,
            When::Always => true,
        }
    }
}

/// What a step does
#[derive(Debug, Clone)]
pub enum StepKind {
    /// Populate the working directory with the project source
    Checkout,
    /// Restore the first matching cache entry
    RestoreCache { keys: Vec<CacheKeyTemplate> },
    /// Save paths under a rendered key unless it already exists
    SaveCache {
        key: CacheKeyTemplate,
        paths: Vec<String>,
    },
    /// Run a shell command
    Run {
        command: String,
        environment: HashMap<String, String>,
        working_directory: Option<String>,
    },
    /// Copy a file or directory into the artifact store
    StoreArtifacts {
        path: String,
        destination: Option<String>,
    },
    /// Copy test reports into the artifact store
    StoreTestResults { path: String },
    /// Forward a coverage report to an aggregation service
    UploadCoverage {
        file: String,
        uploader: String,
        flags: Vec<String>,
        token_env: Option<String>,
    },
}

impl StepKind {
    /// Name used when the step does not declare one
    pub fn display_name(&self) -> String {
        match self {
            StepKind::Checkout => "Checkout code".to_string(),
            StepKind::RestoreCache { .. } => "Restoring cache".to_string(),
            StepKind::SaveCache { .. } => "Saving cache".to_string(),
            StepKind::Run { command, .. } => {
                let first = command.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
                first.trim().to_string()
            }
            StepKind::StoreArtifacts { path, .. } => format!("Uploading artifacts from {}", path),
            StepKind::StoreTestResults { path } => format!("Uploading test results from {}", path),
            StepKind::UploadCoverage { file, .. } => format!("Uploading coverage report {}", file),
        }
    }

    /// Short type tag, as written in the job file
    pub fn type_name(&self) -> &'static str {
        match self {
            StepKind::Checkout => "checkout",
            StepKind::RestoreCache { .. } => "restore_cache",
            StepKind::SaveCache { .. } => "save_cache",
            StepKind::Run { .. } => "run",
            StepKind::StoreArtifacts { .. } => "store_artifacts",
            StepKind::StoreTestResults { .. } => "store_test_results",
            StepKind::UploadCoverage { .. } => "upload_coverage",
        }
    }
}

/// A single step in a job
#[derive(Debug, Clone)]
pub struct Step {
    pub name: String,
    pub kind: StepKind,
    pub when: When,
    /// Timeout in seconds
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct StepDefaults {
    pub timeout_secs: u64,
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: 1800, // 30 minutes
        }
    }
}

fn dependency_install_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\bpip3?\s+install\b[^\n;&|]*\s(-r|--requirement)(\s+|=)\S+")
            .expect("valid dependency install regex")
    })
}

fn package_install_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\bpip3?\s+install\b[^\n;&|]*\s(-e|--editable)\s+\.|\bpip3?\s+install\s+\.(\s|$|\[)|\bsetup\.py\s+(install|develop)\b",
        )
        .expect("valid package install regex")
    })
}

impl Step {
    /// Build a step from its job file form
    pub fn from_config(config: &StepConfig, defaults: &StepDefaults) -> Result<Self> {
        let spec = config.spec()?;

        let (kind, name, when, timeout) = match spec {
            StepSpec::Checkout => (StepKind::Checkout, None, When::default(), None),
            StepSpec::RestoreCache(c) => {
                let keys = c
                    .all_keys()
                    .iter()
                    .map(|k| CacheKeyTemplate::parse(k))
                    .collect::<Result<Vec<_>, _>>()
                    .context("Invalid restore_cache key")?;
                (StepKind::RestoreCache { keys }, c.name, When::Always, None)
            }
            StepSpec::SaveCache(c) => {
                let key = CacheKeyTemplate::parse(&c.key).context("Invalid save_cache key")?;
                (
                    StepKind::SaveCache { key, paths: c.paths },
                    c.name,
                    c.when.unwrap_or_default(),
                    None,
                )
            }
            StepSpec::Run(r) => (
                StepKind::Run {
                    command: r.command,
                    environment: r.environment,
                    working_directory: r.working_directory,
                },
                r.name,
                r.when.unwrap_or_default(),
                r.timeout_secs,
            ),
            StepSpec::StoreArtifacts(a) => (
                StepKind::StoreArtifacts {
                    path: a.path,
                    destination: a.destination,
                },
                None,
                When::Always,
                None,
            ),
            StepSpec::StoreTestResults(t) => (
                StepKind::StoreTestResults { path: t.path },
                None,
                When::Always,
                None,
            ),
            StepSpec::UploadCoverage(u) => (
                StepKind::UploadCoverage {
                    file: u.file,
                    uploader: u
                        .uploader
                        .unwrap_or_else(|| DEFAULT_COVERAGE_UPLOADER.to_string()),
                    flags: u.flags,
                    token_env: u.token_env,
                },
                u.name,
                u.when.unwrap_or_default(),
                None,
            ),
        };

        Ok(Step {
            name: name.unwrap_or_else(|| kind.display_name()),
            kind,
            when,
            timeout_secs: timeout.unwrap_or(defaults.timeout_secs),
        })
    }

    /// Shell command for run steps
    pub fn command(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Run { command, .. } => Some(command),
            _ => None,
        }
    }

    /// Byte offset of the first manifest install in the command
    pub fn dependency_install_offset(&self) -> Option<usize> {
        self.command()
            .and_then(|c| dependency_install_regex().find(c))
            .map(|m| m.start())
    }

    /// Byte offset of the first install of the package under test
    pub fn package_install_offset(&self) -> Option<usize> {
        self.command()
            .and_then(|c| package_install_regex().find(c))
            .map(|m| m.start())
    }

    /// Whether this step installs declared dependencies from a manifest
    pub fn is_dependency_install(&self) -> bool {
        self.dependency_install_offset().is_some()
    }

    /// Whether this step installs the package under test itself
    pub fn is_package_install(&self) -> bool {
        self.package_install_offset().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_step(command: &str) -> Step {
        Step {
            name: "test".to_string(),
            kind: StepKind::Run {
                command: command.to_string(),
                environment: HashMap::new(),
                working_directory: None,
            },
            when: When::OnSuccess,
            timeout_secs: 60,
        }
    }

    #[test]
    fn test_when_should_run() {
        assert!(When::OnSuccess.should_run(false));
        assert!(!When::OnSuccess.should_run(true));
        assert!(When::OnFail.should_run(true));
        assert!(!When::OnFail.should_run(false));
        assert!(When::Always.should_run(true));
        assert!(When::Always.should_run(false));
    }

    #[test]
    fn test_dependency_install_detection() {
        assert!(run_step("pip install -r requirements.txt").is_dependency_install());
        assert!(run_step(". venv/bin/activate\npip3 install --requirement=requirements-dev.txt")
            .is_dependency_install());
        assert!(!run_step("pip install -e .").is_dependency_install());
    }

    #[test]
    fn test_package_install_detection() {
        assert!(run_step("pip install -e .").is_package_install());
        assert!(run_step("pip install --editable .").is_package_install());
        assert!(run_step("pip install .").is_package_install());
        assert!(run_step("python setup.py develop").is_package_install());
        assert!(!run_step("pip install -r requirements.txt").is_package_install());
        assert!(!run_step("pip install pytest-cov").is_package_install());
    }

    #[test]
    fn test_display_name_uses_first_command_line() {
        let step = run_step("\n  sudo apt-get install ncbi-blast+\n  echo done");
        assert_eq!(step.kind.display_name(), "sudo apt-get install ncbi-blast+");
    }
}
