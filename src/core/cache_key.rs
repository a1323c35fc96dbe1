//! Cache key templates
//!
//! Keys such as `v1-deps-{{ .Branch }}-{{ checksum "requirements.txt" }}`
//! are rendered per job. `checksum` hashes file contents, so the same
//! manifests on the same branch always produce the same key.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tracing::debug;

/// Upper bound on a rendered key, in bytes
pub const MAX_KEY_LENGTH: usize = 900;

#[derive(Debug, Error)]
pub enum CacheKeyError {
    #[error("unterminated expression in cache key template '{0}'")]
    Unterminated(String),

    #[error("unknown expression '{{{{ {0} }}}}' in cache key template")]
    UnknownExpression(String),

    #[error("cannot checksum '{}': {}", .path.display(), .source)]
    Checksum {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rendered cache key is {0} bytes, limit is {limit}", limit = MAX_KEY_LENGTH)]
    TooLong(usize),
}

/// Values a key template may reference
#[derive(Debug, Clone, Default)]
pub struct KeyContext {
    pub branch: String,
    pub revision: String,
    pub environment: HashMap<String, String>,
    /// Directory relative `checksum` paths are resolved against
    pub base_dir: PathBuf,
    /// Directory `~/` expands to
    pub home_dir: PathBuf,
}

impl KeyContext {
    fn resolve(&self, path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            self.home_dir.join(rest)
        } else {
            let candidate = Path::new(path);
            if candidate.is_absolute() {
                candidate.to_path_buf()
            } else {
                self.base_dir.join(candidate)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Branch,
    Revision,
    Environment(String),
    Checksum(String),
    Epoch,
    Arch,
}

/// A parsed cache key template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeyTemplate {
    source: String,
    segments: Vec<Segment>,
}

fn expression_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*(.*?)\s*\}\}").expect("valid expression regex"))
}

fn checksum_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^checksum\s+"([^"]+)"$"#).expect("valid checksum regex"))
}

fn environment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\.Environment\.([A-Za-z_][A-Za-z0-9_]*)$").expect("valid environment regex")
    })
}

impl CacheKeyTemplate {
    /// Parse a key template
    pub fn parse(template: &str) -> Result<Self, CacheKeyError> {
        let mut segments = Vec::new();
        let mut last = 0;

        for captures in expression_regex().captures_iter(template) {
            let whole = captures.get(0).expect("capture 0 always present");
            if whole.start() > last {
                segments.push(Segment::Literal(template[last..whole.start()].to_string()));
            }
            segments.push(Self::parse_expression(&captures[1])?);
            last = whole.end();
        }
        if last < template.len() {
            segments.push(Segment::Literal(template[last..].to_string()));
        }

        let dangling = segments.iter().any(|s| match s {
            Segment::Literal(text) => text.contains("{{") || text.contains("}}"),
            _ => false,
        });
        if dangling {
            return Err(CacheKeyError::Unterminated(template.to_string()));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    fn parse_expression(expression: &str) -> Result<Segment, CacheKeyError> {
        let segment = match expression {
            ".Branch" => Segment::Branch,
            ".Revision" => Segment::Revision,
            "epoch" => Segment::Epoch,
            "arch" => Segment::Arch,
            other => {
                if let Some(c) = checksum_regex().captures(other) {
                    Segment::Checksum(c[1].to_string())
                } else if let Some(c) = environment_regex().captures(other) {
                    Segment::Environment(c[1].to_string())
                } else {
                    return Err(CacheKeyError::UnknownExpression(other.to_string()));
                }
            }
        };
        Ok(segment)
    }

    /// The template as written
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Literal text before the first expression
    pub fn static_prefix(&self) -> String {
        self.segments
            .iter()
            .map_while(|s| match s {
                Segment::Literal(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Files hashed by `checksum` expressions, in template order
    pub fn checksum_files(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Checksum(path) => Some(path.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Whether the key changes when a dependency manifest changes
    pub fn is_content_addressed(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Checksum(_)))
    }

    /// Whether the key is scoped to a branch
    pub fn is_branch_scoped(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Branch))
    }

    /// Whether the template has no expressions at all
    pub fn is_static(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Literal(_)))
    }

    /// Render the key for a job
    pub fn render(&self, context: &KeyContext) -> Result<String, CacheKeyError> {
        let mut key = String::new();

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => key.push_str(text),
                Segment::Branch => key.push_str(&context.branch),
                Segment::Revision => key.push_str(&context.revision),
                Segment::Environment(name) => {
                    if let Some(value) = context.environment.get(name) {
                        key.push_str(value);
                    }
                }
                Segment::Checksum(path) => {
                    key.push_str(&checksum_file(&context.resolve(path))?);
                }
                Segment::Epoch => key.push_str(&chrono::Utc::now().timestamp().to_string()),
                Segment::Arch => {
                    key.push_str(std::env::consts::OS);
                    key.push('-');
                    key.push_str(std::env::consts::ARCH);
                }
            }
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(CacheKeyError::TooLong(key.len()));
        }

        debug!("Rendered cache key '{}' -> '{}'", self.source, key);
        Ok(key)
    }
}

/// SHA-256 of a file's contents as lowercase hex
pub fn checksum_file(path: &Path) -> Result<String, CacheKeyError> {
    let contents = fs::read(path).map_err(|source| CacheKeyError::Checksum {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(hex::encode(hasher.finalize()))
}
