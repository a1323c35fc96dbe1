//! Template and matrix expansion
//!
//! A job either inlines its steps or names a template. A template job may
//! fan out over several images with `matrix: { image: [...] }`; each image
//! becomes its own job named `<job>-<tag>`.

use crate::core::config::{DefaultsConfig, JobConfig, StepConfig, TemplateConfig};
use anyhow::Result;
use std::collections::{BTreeMap, HashMap};

/// A concrete job after template and matrix expansion
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedJob {
    /// Unique job name
    pub name: String,
    /// Name as declared in the job file
    pub base: String,
    /// Template the steps came from
    pub template: Option<String>,
    pub image: Option<String>,
    pub working_directory: Option<String>,
    pub environment: HashMap<String, String>,
    pub steps: Vec<StepConfig>,
    pub max_retries: usize,
    pub timeout_secs: Option<u64>,
}

impl ExpandedJob {
    /// Whether this job came from a matrix
    pub fn is_matrix_entry(&self) -> bool {
        self.name != self.base
    }
}

/// Expand one declared job
pub fn expand(
    name: &str,
    job: &JobConfig,
    templates: &BTreeMap<String, TemplateConfig>,
    defaults: &DefaultsConfig,
) -> Result<Vec<ExpandedJob>> {
    let template = match &job.template {
        Some(t) => Some(
            templates
                .get(t)
                .ok_or_else(|| anyhow::anyhow!("Job '{}' uses non-existent template '{}'", name, t))?,
        ),
        None => None,
    };

    let steps = match (template, &job.steps) {
        (_, Some(steps)) => steps.clone(),
        (Some(t), None) => t.steps.clone(),
        (None, None) => Vec::new(),
    };

    // Template environment is overridden by the job's own
    let mut environment = template.map(|t| t.environment.clone()).unwrap_or_default();
    environment.extend(job.environment.clone());

    let working_directory = job
        .working_directory
        .clone()
        .or_else(|| template.and_then(|t| t.working_directory.clone()))
        .or_else(|| defaults.working_directory.clone());

    let base = ExpandedJob {
        name: name.to_string(),
        base: name.to_string(),
        template: job.template.clone(),
        image: job.image.clone(),
        working_directory,
        environment,
        steps,
        max_retries: job.max_retries.or(defaults.max_retries).unwrap_or(0),
        timeout_secs: job.timeout_secs,
    };

    let Some(matrix) = &job.matrix else {
        return Ok(vec![base]);
    };

    Ok(matrix
        .image
        .iter()
        .map(|image| ExpandedJob {
            name: format!("{}-{}", name, image_tag_slug(image)),
            image: Some(image.clone()),
            ..base.clone()
        })
        .collect())
}

/// Job name suffix for an image: the tag, or the last path segment
pub fn image_tag_slug(image: &str) -> String {
    let segment = image.rsplit('/').next().unwrap_or(image);
    let tag = match segment.rsplit_once(':') {
        Some((_, tag)) if !tag.is_empty() => tag,
        Some((repo, _)) => repo,
        None => segment,
    };

    tag.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Resolve a workflow job reference to expanded job names
///
/// A matrix job's declared name refers to every entry.
pub fn resolve_job_ref(reference: &str, jobs: &[ExpandedJob]) -> Vec<String> {
    if jobs.iter().any(|j| j.name == reference) {
        return vec![reference.to_string()];
    }
    jobs.iter()
        .filter(|j| j.base == reference)
        .map(|j| j.name.clone())
        .collect()
}

/// Jobs sharing a template
#[derive(Debug, Clone)]
pub struct MatrixGroup<'a> {
    pub template: String,
    pub jobs: Vec<&'a ExpandedJob>,
}

impl MatrixGroup<'_> {
    /// Whether every member resolves to the same steps and settings
    pub fn differs_only_by_image(&self) -> bool {
        let Some(first) = self.jobs.first() else {
            return true;
        };
        self.jobs.iter().all(|job| {
            job.steps == first.steps
                && job.working_directory == first.working_directory
                && job.environment == first.environment
        })
    }

    pub fn images(&self) -> Vec<&str> {
        self.jobs.iter().filter_map(|j| j.image.as_deref()).collect()
    }
}

/// Group template jobs by template name
pub fn matrix_groups(jobs: &[ExpandedJob]) -> Vec<MatrixGroup<'_>> {
    let mut groups: BTreeMap<&str, Vec<&ExpandedJob>> = BTreeMap::new();
    for job in jobs {
        if let Some(template) = &job.template {
            groups.entry(template.as_str()).or_default().push(job);
        }
    }
    groups
        .into_iter()
        .map(|(template, jobs)| MatrixGroup {
            template: template.to_string(),
            jobs,
        })
        .collect()
}
