//! Job context - environment and workspace paths for one job run

use crate::core::cache_key::KeyContext;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Name of the per-job environment file inside the workspace
pub const ENV_FILE_NAME: &str = ".bash_env";

/// Everything a step needs to know about the job it belongs to
///
/// Environment precedence, lowest first: pipeline variables, job
/// environment, step environment, command-line overrides.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub execution_id: Uuid,
    pub job_id: String,
    pub image: Option<String>,
    pub branch: String,
    pub revision: String,

    /// Job workspace root, also used as `HOME`
    pub workspace: PathBuf,

    /// Resolved job working directory
    pub working_dir: PathBuf,

    /// Pipeline variables merged with the job environment
    pub environment: HashMap<String, String>,

    /// Values given on the command line
    pub overrides: HashMap<String, String>,
}

impl JobContext {
    /// Create a context for a job workspace
    pub fn new(
        execution_id: Uuid,
        job_id: impl Into<String>,
        workspace: impl Into<PathBuf>,
        working_directory: Option<&str>,
    ) -> Self {
        let workspace = workspace.into();
        let working_dir = match working_directory {
            Some(dir) => resolve_in(&workspace, &workspace, dir),
            None => workspace.clone(),
        };

        Self {
            execution_id,
            job_id: job_id.into(),
            image: None,
            branch: String::new(),
            revision: String::new(),
            workspace,
            working_dir,
            environment: HashMap::new(),
            overrides: HashMap::new(),
        }
    }

    pub fn with_image(mut self, image: Option<String>) -> Self {
        self.image = image;
        self
    }

    pub fn with_revision(mut self, branch: impl Into<String>, revision: impl Into<String>) -> Self {
        self.branch = branch.into();
        self.revision = revision.into();
        self
    }

    /// Layer pipeline variables then job environment
    pub fn with_environment(
        mut self,
        variables: &HashMap<String, String>,
        job_environment: &HashMap<String, String>,
    ) -> Self {
        self.environment.extend(variables.clone());
        self.environment.extend(job_environment.clone());
        self
    }

    pub fn with_overrides(mut self, overrides: HashMap<String, String>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Path of the environment file sourced by every step
    pub fn env_file(&self) -> PathBuf {
        self.workspace.join(ENV_FILE_NAME)
    }

    /// Resolve a step path: `~/` is the workspace, relative paths the working directory
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        resolve_in(&self.workspace, &self.working_dir, path)
    }

    /// Variables every step sees regardless of the job file
    pub fn builtin_environment(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("CI".to_string(), "true".to_string());
        env.insert("CI_BRANCH".to_string(), self.branch.clone());
        env.insert("CI_REVISION".to_string(), self.revision.clone());
        env.insert("CI_JOB".to_string(), self.job_id.clone());
        env.insert("CI_EXECUTION_ID".to_string(), self.execution_id.to_string());
        env.insert(
            "CI_IMAGE".to_string(),
            self.image.clone().unwrap_or_default(),
        );
        env.insert("HOME".to_string(), self.workspace.display().to_string());
        env.insert("BASH_ENV".to_string(), self.env_file().display().to_string());
        env
    }

    /// Full environment for a step
    pub fn step_environment(&self, step_environment: &HashMap<String, String>) -> HashMap<String, String> {
        let mut env = self.builtin_environment();
        env.extend(self.environment.clone());
        env.extend(step_environment.clone());
        env.extend(self.overrides.clone());
        env
    }

    /// Values for rendering cache key templates
    pub fn key_context(&self) -> KeyContext {
        KeyContext {
            branch: self.branch.clone(),
            revision: self.revision.clone(),
            environment: self.step_environment(&HashMap::new()),
            base_dir: self.working_dir.clone(),
            home_dir: self.workspace.clone(),
        }
    }
}

fn resolve_in(home: &Path, base: &Path, path: &str) -> PathBuf {
    if path == "~" {
        home.to_path_buf()
    } else if let Some(rest) = path.strip_prefix("~/") {
        home.join(rest)
    } else if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        base.join(path)
    }
}
