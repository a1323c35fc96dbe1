//! Dependency cache store
//!
//! Entries are immutable: saving a key that already exists is a no-op.
//! Each entry lives in `<root>/<sha256(key)[..16]>/` with an `entry.json`
//! manifest and one `data/<i>` copy per saved path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

const MANIFEST: &str = "entry.json";
const DATA_DIR: &str = "data";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error on {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt cache entry {}: {}", .path.display(), .message)]
    Corrupt { path: PathBuf, message: String },

    #[error("cache task failed: {0}")]
    Task(String),
}

/// Manifest of a stored entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Rendered key
    pub key: String,

    pub created_at: DateTime<Utc>,

    /// Paths as written in the step, in `data/<i>` order
    pub paths: Vec<String>,

    pub size_bytes: u64,
}

/// Result of a save
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved { size_bytes: u64 },
    /// The key was already present and left untouched
    AlreadyExists,
    /// None of the paths existed
    NothingToSave,
}

/// Trait for cache backends
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Exact match, else the most recent entry whose key starts with `key`
    async fn find(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Copy an entry's paths to `destinations` (same order as `entry.paths`)
    async fn restore(&self, entry: &CacheEntry, destinations: &[PathBuf]) -> Result<u64, CacheError>;

    /// Store `(declared path, source)` pairs under `key` unless it exists
    async fn save(&self, key: &str, sources: &[(String, PathBuf)]) -> Result<SaveOutcome, CacheError>;

    /// All entries, most recent first
    async fn list(&self) -> Result<Vec<CacheEntry>, CacheError>;

    /// Remove every entry, returning how many were removed
    async fn clear(&self) -> Result<usize, CacheError>;
}

/// Cache entries stored as plain directories
#[derive(Debug, Clone)]
pub struct DirectoryCacheStore {
    root: PathBuf,
}

impl DirectoryCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store under the platform cache directory
    pub fn with_default_path() -> Self {
        let base = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join("cirun"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory name for a key
    pub fn entry_id(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())[..16].to_string()
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        self.root.join(Self::entry_id(key))
    }

    fn read_manifest(dir: &Path) -> Result<Option<CacheEntry>, CacheError> {
        let path = dir.join(MANIFEST);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| CacheError::Corrupt {
                path,
                message: e.to_string(),
            })
    }

    fn list_blocking(root: &Path) -> Result<Vec<CacheEntry>, CacheError> {
        let dir = match fs::read_dir(root) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CacheError::Io {
                    path: root.to_path_buf(),
                    source,
                })
            }
        };

        let mut entries = Vec::new();
        for item in dir.flatten() {
            let path = item.path();
            if !path.is_dir() || item.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            match Self::read_manifest(&path) {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => warn!("Skipping cache entry: {}", e),
            }
        }
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    fn save_blocking(
        root: &Path,
        target: &Path,
        key: &str,
        sources: &[(String, PathBuf)],
    ) -> Result<SaveOutcome, CacheError> {
        if target.join(MANIFEST).exists() {
            return Ok(SaveOutcome::AlreadyExists);
        }

        let present: Vec<&(String, PathBuf)> = sources
            .iter()
            .filter(|(declared, source)| {
                let exists = source.symlink_metadata().is_ok();
                if !exists {
                    warn!("Cache path {} does not exist, skipping", declared);
                }
                exists
            })
            .collect();
        if present.is_empty() {
            return Ok(SaveOutcome::NothingToSave);
        }

        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: io::Error| CacheError::Io { path, source }
        };

        fs::create_dir_all(root).map_err(io_err(root))?;
        let staging = root.join(format!(".tmp-{}", Uuid::new_v4()));
        let data = staging.join(DATA_DIR);
        fs::create_dir_all(&data).map_err(io_err(&data))?;

        let mut size_bytes = 0;
        for (i, (_, source)) in present.iter().enumerate() {
            let dest = data.join(i.to_string());
            match copy_tree(source, &dest) {
                Ok(bytes) => size_bytes += bytes,
                Err(e) => {
                    let _ = fs::remove_dir_all(&staging);
                    return Err(io_err(source)(e));
                }
            }
        }

        let entry = CacheEntry {
            key: key.to_string(),
            created_at: Utc::now(),
            paths: present.iter().map(|(declared, _)| declared.clone()).collect(),
            size_bytes,
        };
        let manifest = serde_json::to_string_pretty(&entry).map_err(|e| CacheError::Corrupt {
            path: staging.clone(),
            message: e.to_string(),
        })?;
        fs::write(staging.join(MANIFEST), manifest).map_err(io_err(&staging))?;

        // Whoever renames first wins; later writers discard their copy
        if let Err(e) = fs::rename(&staging, target) {
            let _ = fs::remove_dir_all(&staging);
            if target.join(MANIFEST).exists() {
                return Ok(SaveOutcome::AlreadyExists);
            }
            return Err(io_err(target)(e));
        }

        Ok(SaveOutcome::Saved { size_bytes })
    }
}

async fn blocking<T, F>(f: F) -> Result<T, CacheError>
where
    F: FnOnce() -> Result<T, CacheError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CacheError::Task(e.to_string()))?
}

#[async_trait]
impl CacheStore for DirectoryCacheStore {
    async fn find(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let root = self.root.clone();
        let exact_dir = self.entry_dir(key);
        let key = key.to_string();

        blocking(move || {
            if let Some(entry) = Self::read_manifest(&exact_dir)? {
                if entry.key == key {
                    debug!("Exact cache hit for {}", key);
                    return Ok(Some(entry));
                }
            }

            // Entries are sorted newest first
            Ok(Self::list_blocking(&root)?
                .into_iter()
                .find(|e| e.key.starts_with(&key)))
        })
        .await
    }

    async fn restore(&self, entry: &CacheEntry, destinations: &[PathBuf]) -> Result<u64, CacheError> {
        let data = self.entry_dir(&entry.key).join(DATA_DIR);
        let destinations = destinations.to_vec();

        blocking(move || {
            let mut total = 0;
            for (i, dest) in destinations.iter().enumerate() {
                let source = data.join(i.to_string());
                total += copy_tree(&source, dest).map_err(|source_err| CacheError::Io {
                    path: dest.clone(),
                    source: source_err,
                })?;
            }
            Ok(total)
        })
        .await
    }

    async fn save(&self, key: &str, sources: &[(String, PathBuf)]) -> Result<SaveOutcome, CacheError> {
        let root = self.root.clone();
        let target = self.entry_dir(key);
        let key = key.to_string();
        let sources = sources.to_vec();

        blocking(move || Self::save_blocking(&root, &target, &key, &sources)).await
    }

    async fn list(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let root = self.root.clone();
        blocking(move || Self::list_blocking(&root)).await
    }

    async fn clear(&self) -> Result<usize, CacheError> {
        let root = self.root.clone();
        blocking(move || {
            let entries = match fs::read_dir(&root) {
                Ok(d) => d,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
                Err(source) => return Err(CacheError::Io { path: root, source }),
            };
            let mut removed = 0;
            for item in entries.flatten() {
                let path = item.path();
                if path.is_dir() {
                    fs::remove_dir_all(&path).map_err(|source| CacheError::Io {
                        path: path.clone(),
                        source,
                    })?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await
    }
}

/// Copy a file, symlink or directory tree, returning bytes copied
///
/// Directories are merged into an existing destination.
pub(crate) fn copy_tree(source: &Path, dest: &Path) -> io::Result<u64> {
    let meta = source.symlink_metadata()?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    if meta.file_type().is_symlink() {
        let link = fs::read_link(source)?;
        if dest.symlink_metadata().is_ok() {
            fs::remove_file(dest)?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&link, dest)?;
        #[cfg(not(unix))]
        fs::copy(source, dest)?;
        return Ok(0);
    }

    if meta.is_dir() {
        fs::create_dir_all(dest)?;
        let mut total = 0;
        for item in fs::read_dir(source)? {
            let item = item?;
            total += copy_tree(&item.path(), &dest.join(item.file_name()))?;
        }
        return Ok(total);
    }

    fs::copy(source, dest)
}
