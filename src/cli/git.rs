//! Branch and revision of the project being built

use std::path::Path;
use tokio::process::Command;
use tracing::debug;

async fn rev_parse(dir: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .arg("rev-parse")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        debug!("git rev-parse {:?} failed in {}", args, dir.display());
        return None;
    }

    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!value.is_empty()).then_some(value)
}

/// Current branch, `None` outside a repository or on a detached head
pub async fn detect_branch(dir: &Path) -> Option<String> {
    rev_parse(dir, &["--abbrev-ref", "HEAD"])
        .await
        .filter(|b| b != "HEAD")
}

/// Current commit hash
pub async fn detect_revision(dir: &Path) -> Option<String> {
    rev_parse(dir, &["HEAD"]).await
}
