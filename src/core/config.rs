//! Job file configuration from YAML

use crate::core::{
    matrix::{self, ExpandedJob},
    step::{Step, StepDefaults},
    Pipeline,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// Variable definition - a literal value or a passthrough from the host environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableDefinition {
    /// Literal value
    String(String),
    /// Read from the host environment when the pipeline starts
    Env { from_env: String, required: bool },
}

impl VariableDefinition {
    /// Resolve the value against the host environment
    pub fn resolve(&self, name: &str) -> Result<Option<String>> {
        match self {
            VariableDefinition::String(s) => Ok(Some(s.clone())),
            VariableDefinition::Env { from_env, required } => match std::env::var(from_env) {
                Ok(value) => Ok(Some(value)),
                Err(_) if *required => anyhow::bail!(
                    "Variable '{}' requires host environment variable '{}'",
                    name,
                    from_env
                ),
                Err(_) => Ok(None),
            },
        }
    }
}

/// Top-level job file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Job file format version (informational)
    #[serde(default)]
    pub version: Option<Value>,

    /// Pipeline name (defaults to the file stem)
    #[serde(default)]
    pub name: String,

    /// Git URL cloned by `checkout`; local source is copied when absent
    #[serde(default)]
    pub repository: Option<String>,

    /// Environment shared by every job
    #[serde(default)]
    variables: HashMap<String, Value>,

    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Reusable step sequences
    #[serde(default)]
    pub templates: BTreeMap<String, TemplateConfig>,

    pub jobs: BTreeMap<String, JobConfig>,

    #[serde(default)]
    pub workflows: BTreeMap<String, WorkflowConfig>,
}

/// Pipeline-wide defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Default timeout for steps (in seconds)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Number of times a failed job is re-run
    #[serde(default)]
    pub max_retries: Option<usize>,

    #[serde(default)]
    pub working_directory: Option<String>,
}

/// A named step sequence shared by several jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    #[serde(default)]
    pub working_directory: Option<String>,

    #[serde(default, deserialize_with = "string_map")]
    pub environment: HashMap<String, String>,

    pub steps: Vec<StepConfig>,
}

/// A job as written in the job file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobConfig {
    /// Template providing the steps
    #[serde(default)]
    pub template: Option<String>,

    /// Container image
    #[serde(default)]
    pub image: Option<String>,

    /// Fan out over several images
    #[serde(default)]
    pub matrix: Option<MatrixConfig>,

    #[serde(default)]
    pub working_directory: Option<String>,

    #[serde(default, deserialize_with = "string_map")]
    pub environment: HashMap<String, String>,

    /// Inline steps (exclusive with `template`)
    #[serde(default)]
    pub steps: Option<Vec<StepConfig>>,

    #[serde(default)]
    pub max_retries: Option<usize>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Matrix parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixConfig {
    pub image: Vec<String>,
}

/// A workflow selects jobs and orders them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub jobs: Vec<WorkflowJobEntry>,
}

/// `- job` or `- job: { requires: [...] }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkflowJobEntry {
    Name(String),
    Detailed(BTreeMap<String, WorkflowJobOptions>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowJobOptions {
    #[serde(default)]
    pub requires: Vec<String>,
}

impl WorkflowJobEntry {
    /// Job name and the jobs it requires
    pub fn parts(&self) -> Vec<(&str, &[String])> {
        match self {
            WorkflowJobEntry::Name(name) => vec![(name.as_str(), &[][..])],
            WorkflowJobEntry::Detailed(map) => map
                .iter()
                .map(|(name, opts)| (name.as_str(), opts.requires.as_slice()))
                .collect(),
        }
    }
}

/// A step as written: `checkout` or a single-key map such as `run: ...`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepConfig(pub Value);

/// Parsed step body
#[derive(Debug, Clone)]
pub enum StepSpec {
    Checkout,
    RestoreCache(RestoreCacheConfig),
    SaveCache(SaveCacheConfig),
    Run(RunConfig),
    StoreArtifacts(StoreArtifactsConfig),
    StoreTestResults(StoreTestResultsConfig),
    UploadCoverage(UploadCoverageConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestoreCacheConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub keys: Vec<String>,
}

impl RestoreCacheConfig {
    /// `key` followed by `keys`, in lookup order
    pub fn all_keys(&self) -> Vec<String> {
        self.key.iter().chain(self.keys.iter()).cloned().collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SaveCacheConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub key: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub when: Option<crate::core::step::When>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub command: String,
    #[serde(default, deserialize_with = "string_map")]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub when: Option<crate::core::step::When>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreArtifactsConfig {
    pub path: String,
    #[serde(default)]
    pub destination: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreTestResultsConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadCoverageConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub file: String,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default)]
    pub when: Option<crate::core::step::When>,
}

impl StepConfig {
    /// Parse the step body
    pub fn spec(&self) -> Result<StepSpec> {
        let (kind, body) = match &self.0 {
            Value::String(s) => (s.as_str(), Value::Null),
            Value::Mapping(map) if map.len() == 1 => {
                let (k, v) = map
                    .iter()
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("Empty step"))?;
                let kind = k
                    .as_str()
                    .ok_or_else(|| anyhow::anyhow!("Step type must be a string"))?;
                (kind, v.clone())
            }
            Value::Mapping(map) => {
                anyhow::bail!("A step must have exactly one type key, found {}", map.len())
            }
            other => anyhow::bail!("Invalid step: {:?}", other),
        };

        let spec = match kind {
            "checkout" => StepSpec::Checkout,
            "restore_cache" => StepSpec::RestoreCache(
                serde_yaml::from_value(body).context("Invalid restore_cache step")?,
            ),
            "save_cache" => StepSpec::SaveCache(
                serde_yaml::from_value(body).context("Invalid save_cache step")?,
            ),
            "run" => match body {
                Value::String(command) => StepSpec::Run(RunConfig {
                    name: None,
                    command,
                    environment: HashMap::new(),
                    working_directory: None,
                    when: None,
                    timeout_secs: None,
                }),
                other => StepSpec::Run(serde_yaml::from_value(other).context("Invalid run step")?),
            },
            "store_artifacts" => StepSpec::StoreArtifacts(
                serde_yaml::from_value(body).context("Invalid store_artifacts step")?,
            ),
            "store_test_results" => StepSpec::StoreTestResults(
                serde_yaml::from_value(body).context("Invalid store_test_results step")?,
            ),
            "upload_coverage" => StepSpec::UploadCoverage(
                serde_yaml::from_value(body).context("Invalid upload_coverage step")?,
            ),
            other => anyhow::bail!("Unknown step type '{}'", other),
        };

        Ok(spec)
    }
}

/// Accept scalar YAML values (`CI: true`, `PY: 3.8`) as strings
fn string_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: HashMap<String, Value> = HashMap::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s,
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                Value::Null => String::new(),
                _ => {
                    return Err(serde::de::Error::custom(format!(
                        "environment value for '{}' must be a scalar",
                        k
                    )))
                }
            };
            Ok((k, value))
        })
        .collect()
}

impl PipelineConfig {
    /// Load a job file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config: PipelineConfig = serde_yaml::from_str(&content)?;
        if config.name.is_empty() {
            config.name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("pipeline")
                .to_string();
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse a job file from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: PipelineConfig = serde_yaml::from_str(yaml)?;
        if config.name.is_empty() {
            config.name = "pipeline".to_string();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn step_defaults(&self) -> StepDefaults {
        let mut defaults = StepDefaults::default();
        if let Some(timeout) = self.defaults.timeout_secs {
            defaults.timeout_secs = timeout;
        }
        defaults
    }

    /// Validate the job file
    pub fn validate(&self) -> Result<()> {
        if self.jobs.is_empty() {
            anyhow::bail!("Job file defines no jobs");
        }

        let defaults = self.step_defaults();

        for (name, template) in &self.templates {
            if template.steps.is_empty() {
                anyhow::bail!("Template '{}' has no steps", name);
            }
            Self::check_steps(&template.steps, &defaults)
                .with_context(|| format!("In template '{}'", name))?;
        }

        for (name, job) in &self.jobs {
            match (&job.template, &job.steps) {
                (Some(_), Some(_)) => {
                    anyhow::bail!("Job '{}' declares both 'template' and 'steps'", name)
                }
                (None, None) => anyhow::bail!("Job '{}' declares neither 'template' nor 'steps'", name),
                (Some(template), None) => {
                    if !self.templates.contains_key(template) {
                        anyhow::bail!("Job '{}' uses non-existent template '{}'", name, template);
                    }
                }
                (None, Some(steps)) => {
                    if steps.is_empty() {
                        anyhow::bail!("Job '{}' has no steps", name);
                    }
                    Self::check_steps(steps, &defaults)
                        .with_context(|| format!("In job '{}'", name))?;
                }
            }

            if let Some(m) = &job.matrix {
                if job.image.is_some() {
                    anyhow::bail!("Job '{}' declares both 'image' and 'matrix'", name);
                }
                if m.image.is_empty() {
                    anyhow::bail!("Job '{}' has an empty matrix", name);
                }
            }
        }

        // Expanded names must be unique across all jobs
        let expanded = self.expand_jobs()?;
        let mut seen = HashSet::new();
        for job in &expanded {
            if !seen.insert(job.name.as_str()) {
                anyhow::bail!("Duplicate job name after matrix expansion: {}", job.name);
            }
        }

        for (workflow, config) in &self.workflows {
            if config.jobs.is_empty() {
                anyhow::bail!("Workflow '{}' has no jobs", workflow);
            }
            let mut members = HashSet::new();
            for entry in &config.jobs {
                for (job, _) in entry.parts() {
                    let resolved = matrix::resolve_job_ref(job, &expanded);
                    if resolved.is_empty() {
                        anyhow::bail!(
                            "Workflow '{}' references non-existent job '{}'",
                            workflow,
                            job
                        );
                    }
                    members.extend(resolved);
                }
            }

            for entry in &config.jobs {
                for (job, requires) in entry.parts() {
                    for required in requires {
                        let resolved = matrix::resolve_job_ref(required, &expanded);
                        if resolved.is_empty() {
                            anyhow::bail!(
                                "Job '{}' in workflow '{}' requires non-existent job '{}'",
                                job,
                                workflow,
                                required
                            );
                        }
                        if required == job {
                            anyhow::bail!("Job '{}' requires itself", job);
                        }
                        if !resolved.iter().all(|r| members.contains(r)) {
                            anyhow::bail!(
                                "Job '{}' in workflow '{}' requires '{}', which is not part of the workflow",
                                job,
                                workflow,
                                required
                            );
                        }
                    }
                }
            }

            self.check_cycles(Some(workflow.as_str()), &expanded)?;
        }

        Ok(())
    }

    fn check_steps(steps: &[StepConfig], defaults: &StepDefaults) -> Result<()> {
        for (index, step_config) in steps.iter().enumerate() {
            let step = Step::from_config(step_config, defaults)
                .with_context(|| format!("Step {} is invalid", index + 1))?;
            match &step.kind {
                crate::core::StepKind::SaveCache { paths, .. } if paths.is_empty() => {
                    anyhow::bail!("Step {}: save_cache needs at least one path", index + 1)
                }
                crate::core::StepKind::RestoreCache { keys } if keys.is_empty() => {
                    anyhow::bail!("Step {}: restore_cache needs at least one key", index + 1)
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Check for cycles in the `requires` graph of one workflow, or of
    /// every workflow merged
    pub(crate) fn check_cycles(&self, workflow: Option<&str>, expanded: &[ExpandedJob]) -> Result<()> {
        let edges = self.requires_edges(workflow, expanded)?;

        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();
        let mut names: Vec<&String> = edges.keys().collect();
        names.sort();

        for name in names {
            if !visited.contains(name) {
                Self::dfs_check(name, &edges, &mut visited, &mut recursion_stack)?;
            }
        }

        Ok(())
    }

    fn dfs_check(
        job: &str,
        edges: &BTreeMap<String, Vec<String>>,
        visited: &mut HashSet<String>,
        recursion_stack: &mut HashSet<String>,
    ) -> Result<()> {
        visited.insert(job.to_string());
        recursion_stack.insert(job.to_string());

        if let Some(requires) = edges.get(job) {
            for dep in requires {
                if recursion_stack.contains(dep) {
                    anyhow::bail!("Cycle detected in workflow involving job '{}'", dep);
                }
                if !visited.contains(dep) {
                    Self::dfs_check(dep, edges, visited, recursion_stack)?;
                }
            }
        }

        recursion_stack.remove(job);
        Ok(())
    }

    /// Selected jobs (by expanded name) and what each requires
    ///
    /// Without a workflow name: every workflow's jobs, or every job when
    /// the file declares no workflows.
    pub fn requires_edges(
        &self,
        workflow: Option<&str>,
        expanded: &[ExpandedJob],
    ) -> Result<BTreeMap<String, Vec<String>>> {
        let mut edges: BTreeMap<String, Vec<String>> = BTreeMap::new();

        let workflows: Vec<&WorkflowConfig> = match workflow {
            Some(name) => vec![self
                .workflows
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("Workflow '{}' not found", name))?],
            None => self.workflows.values().collect(),
        };

        if workflows.is_empty() {
            for job in expanded {
                edges.insert(job.name.clone(), Vec::new());
            }
            return Ok(edges);
        }

        for config in workflows {
            for entry in &config.jobs {
                for (job_ref, requires) in entry.parts() {
                    let required: Vec<String> = requires
                        .iter()
                        .flat_map(|r| matrix::resolve_job_ref(r, expanded))
                        .collect();
                    for job in matrix::resolve_job_ref(job_ref, expanded) {
                        let deps = edges.entry(job).or_default();
                        for r in &required {
                            if !deps.contains(r) {
                                deps.push(r.clone());
                            }
                        }
                    }
                }
            }
        }

        Ok(edges)
    }

    /// Expand templates and matrices into concrete jobs
    pub fn expand_jobs(&self) -> Result<Vec<ExpandedJob>> {
        let mut jobs = Vec::new();
        for (name, job) in &self.jobs {
            jobs.extend(matrix::expand(name, job, &self.templates, &self.defaults)?);
        }
        Ok(jobs)
    }

    /// Get variables as parsed VariableDefinition enum
    pub fn get_variables(&self) -> HashMap<String, VariableDefinition> {
        let mut vars = HashMap::new();

        for (key, value) in &self.variables {
            let var_def = match value {
                Value::String(s) => VariableDefinition::String(s.clone()),
                Value::Bool(b) => VariableDefinition::String(b.to_string()),
                Value::Number(n) => VariableDefinition::String(n.to_string()),
                Value::Mapping(map) => {
                    // { from_env: "NAME", required: true/false }
                    let from_env = map
                        .get(Value::String("from_env".to_string()))
                        .and_then(|v| v.as_str())
                        .unwrap_or(key)
                        .to_string();

                    let required = map
                        .get(Value::String("required".to_string()))
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);

                    VariableDefinition::Env { from_env, required }
                }
                _ => VariableDefinition::String(serde_yaml::to_string(value).unwrap_or_default()),
            };
            vars.insert(key.clone(), var_def);
        }

        vars
    }

    /// Resolve variables against the host environment
    pub fn variables_as_string_map(&self) -> Result<HashMap<String, String>> {
        let mut resolved = HashMap::new();
        for (name, def) in self.get_variables() {
            if let Some(value) = def.resolve(&name)? {
                resolved.insert(name, value);
            }
        }
        Ok(resolved)
    }

    /// Number of variables declared
    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }

    /// Build the pipeline for a workflow
    pub fn to_pipeline(&self, workflow: Option<&str>) -> Result<Pipeline> {
        Pipeline::from_config(self, workflow)
    }
}
