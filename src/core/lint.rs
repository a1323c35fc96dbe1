//! Job file lint rules
//!
//! Findings are warnings; `validate --strict` treats them as errors.

use crate::core::{
    config::{PipelineConfig, StepConfig},
    matrix,
    step::{Step, StepKind},
};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// A single lint result
#[derive(Debug, Clone, Serialize)]
pub struct LintFinding {
    /// Rule identifier, e.g. `install-order`
    pub rule: &'static str,
    pub severity: Severity,
    /// Template or job the finding refers to
    pub location: String,
    pub message: String,
}

impl fmt::Display for LintFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.rule, self.location, self.message)
    }
}

fn insecure_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:ftp|http)://[^\s'\x22]+").expect("valid url regex"))
}

/// Run every rule over the job file
pub fn lint(config: &PipelineConfig) -> Vec<LintFinding> {
    let defaults = config.step_defaults();
    let mut findings = Vec::new();

    for (location, configs) in step_lists(config) {
        let steps: Vec<Step> = configs
            .iter()
            .filter_map(|c| Step::from_config(c, &defaults).ok())
            .collect();

        check_install_order(&location, &steps, &mut findings);
        check_cache_keys(&location, &steps, &mut findings);
        check_insecure_downloads(&location, &steps, &mut findings);
    }

    check_template_drift(config, &mut findings);

    findings
}

/// Whether findings should fail validation
pub fn has_errors(findings: &[LintFinding], strict: bool) -> bool {
    findings
        .iter()
        .any(|f| strict || f.severity == Severity::Error)
}

fn step_lists(config: &PipelineConfig) -> Vec<(String, &[StepConfig])> {
    let mut lists: Vec<(String, &[StepConfig])> = config
        .templates
        .iter()
        .map(|(name, t)| (format!("template '{}'", name), t.steps.as_slice()))
        .collect();
    lists.extend(config.jobs.iter().filter_map(|(name, job)| {
        job.steps
            .as_deref()
            .map(|steps| (format!("job '{}'", name), steps))
    }));
    lists
}

fn warning(rule: &'static str, location: &str, message: String) -> LintFinding {
    LintFinding {
        rule,
        severity: Severity::Warning,
        location: location.to_string(),
        message,
    }
}

/// The package under test must be installed after its declared dependencies
fn check_install_order(location: &str, steps: &[Step], findings: &mut Vec<LintFinding>) {
    let first = |offset: fn(&Step) -> Option<usize>| {
        steps
            .iter()
            .enumerate()
            .find_map(|(i, s)| offset(s).map(|o| (i, o)))
    };

    let dependency = first(Step::dependency_install_offset);
    let package = first(Step::package_install_offset);

    if let (Some(dep), Some(pkg)) = (dependency, package) {
        if pkg < dep {
            findings.push(warning(
                "install-order",
                location,
                format!(
                    "step '{}' installs the package before step '{}' installs its dependencies",
                    steps[pkg.0].name, steps[dep.0].name
                ),
            ));
        }
    }
}

fn check_cache_keys(location: &str, steps: &[Step], findings: &mut Vec<LintFinding>) {
    let mut save_prefixes = Vec::new();

    for step in steps {
        if let StepKind::SaveCache { key, .. } = &step.kind {
            if !key.is_content_addressed() && !key.is_branch_scoped() {
                findings.push(warning(
                    "cache-key-static",
                    location,
                    format!(
                        "save_cache key '{}' never changes; include a checksum of the dependency manifest",
                        key.as_str()
                    ),
                ));
            }
            save_prefixes.push(key.static_prefix());
        }
    }

    for step in steps {
        if let StepKind::RestoreCache { keys } = &step.kind {
            for key in keys {
                let prefix = key.static_prefix();
                let matched = save_prefixes
                    .iter()
                    .any(|s| s.starts_with(&prefix) || prefix.starts_with(s.as_str()));
                if !matched {
                    findings.push(warning(
                        "cache-restore-unmatched",
                        location,
                        format!(
                            "restore_cache key '{}' matches no save_cache key",
                            key.as_str()
                        ),
                    ));
                }
            }
        }
    }
}

fn check_insecure_downloads(location: &str, steps: &[Step], findings: &mut Vec<LintFinding>) {
    for step in steps {
        let Some(command) = step.command() else {
            continue;
        };
        for url in insecure_url_regex().find_iter(command) {
            findings.push(warning(
                "insecure-download",
                location,
                format!("step '{}' downloads over an unencrypted URL: {}", step.name, url.as_str()),
            ));
        }
    }
}

fn check_template_drift(config: &PipelineConfig, findings: &mut Vec<LintFinding>) {
    let Ok(expanded) = config.expand_jobs() else {
        return;
    };

    for group in matrix::matrix_groups(&expanded) {
        if group.jobs.len() > 1 && !group.differs_only_by_image() {
            let names: Vec<&str> = group.jobs.iter().map(|j| j.name.as_str()).collect();
            findings.push(warning(
                "template-drift",
                &format!("template '{}'", group.template),
                format!(
                    "jobs {} differ in more than their image",
                    names.join(", ")
                ),
            ));
        }
    }

    // Inline jobs with identical steps belong in a template
    let mut by_steps: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for (name, job) in &config.jobs {
        if let Some(steps) = &job.steps {
            if let Ok(fingerprint) = serde_yaml::to_string(steps) {
                by_steps.entry(fingerprint).or_default().push(name);
            }
        }
    }
    for names in by_steps.values().filter(|n| n.len() > 1) {
        findings.push(warning(
            "template-drift",
            &format!("job '{}'", names[0]),
            format!(
                "jobs {} repeat the same steps; move them into a template",
                names.join(", ")
            ),
        ));
    }
}
