//! Repository list input and cloning for batch runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::CloneError;

/// Branch tried first when an entry does not name one.
pub const DEFAULT_BRANCH: &str = "main";

/// One entry of a `--repo-file` list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepoEntry {
    pub repo: String,
    #[serde(default)]
    pub branch: Option<String>,
    /// Free-form product label carried into the report.
    #[serde(default)]
    pub product: Option<String>,
}

impl RepoEntry {
    /// Last path segment of the URL without a `.git` suffix.
    pub fn name(&self) -> String {
        let trimmed = self.repo.trim_end_matches('/');
        let base = trimmed
            .rsplit(['/', ':'])
            .next()
            .unwrap_or(trimmed);
        let base = base.strip_suffix(".git").unwrap_or(base);
        if base.is_empty() {
            "repo".to_string()
        } else {
            base.to_string()
        }
    }
}

pub fn load_repo_file(path: &Path) -> Result<Vec<RepoEntry>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read repo list {}", path.display()))?;
    serde_json::from_str(&data)
        .with_context(|| format!("invalid repo list {}", path.display()))
}

/// Clone `entry` under `temp_root`.
///
/// Tries `git clone -b <branch>` first and falls back to the remote's
/// default branch. A partial clone is removed before the retry. Each attempt
/// is bounded by `timeout`.
pub async fn clone_repo(
    entry: &RepoEntry,
    temp_root: &Path,
    timeout: Duration,
) -> Result<PathBuf, CloneError> {
    let target = unique_dir(temp_root, &entry.name());
    let branch = entry.branch.as_deref().unwrap_or(DEFAULT_BRANCH);

    let first = run_clone(&entry.repo, Some(branch), &target, timeout).await;
    let first_err = match first {
        Ok(()) => {
            info!(repo = %entry.repo, branch, path = %target.display(), "cloned");
            return Ok(target);
        }
        Err(e) => e,
    };
    warn!(repo = %entry.repo, branch, error = %first_err, "branch clone failed; trying default branch");
    remove_partial(&target);

    match run_clone(&entry.repo, None, &target, timeout).await {
        Ok(()) => {
            info!(repo = %entry.repo, path = %target.display(), "cloned default branch");
            Ok(target)
        }
        Err(e) => {
            remove_partial(&target);
            Err(match (first_err, e) {
                (
                    CloneError::Failed { output: a, .. },
                    CloneError::Failed { repo, output: b },
                ) => CloneError::Failed {
                    repo,
                    output: format!("branch attempt: {}; default branch: {}", a, b),
                },
                (_, e) => e,
            })
        }
    }
}

async fn run_clone(
    repo: &str,
    branch: Option<&str>,
    target: &Path,
    timeout: Duration,
) -> Result<(), CloneError> {
    let mut cmd = Command::new("git");
    cmd.arg("clone").arg("--quiet");
    if let Some(b) = branch {
        cmd.arg("-b").arg(b);
    }
    cmd.arg(repo).arg(target).kill_on_drop(true);
    debug!(repo, branch, "running git clone");

    let out = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(result) => result.map_err(CloneError::Spawn)?,
        Err(_) => {
            return Err(CloneError::Timeout {
                repo: repo.to_string(),
                secs: timeout.as_secs(),
            })
        }
    };
    if out.status.success() {
        return Ok(());
    }
    let mut output = String::from_utf8_lossy(&out.stderr).trim().to_string();
    if output.is_empty() {
        output = out.status.to_string();
    }
    Err(CloneError::Failed {
        repo: repo.to_string(),
        output,
    })
}

fn remove_partial(target: &Path) {
    if target.exists() {
        if let Err(e) = std::fs::remove_dir_all(target) {
            warn!(path = %target.display(), error = %e, "failed to remove partial clone");
        }
    }
}

/// `root/name`, or `root/name_<n>` when a previous entry already used it.
fn unique_dir(root: &Path, name: &str) -> PathBuf {
    let candidate = root.join(name);
    if !candidate.exists() {
        return candidate;
    }
    (2..)
        .map(|n| root.join(format!("{}_{}", name, n)))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_repo_file() {
        let mut f = NamedTempFile::new().unwrap();
        write!(
            f,
            r#"[
  {{"repo": "https://github.com/acme/billing.git", "branch": "develop", "product": "Billing"}},
  {{"repo": "git@github.com:acme/web"}}
]"#
        )
        .unwrap();

        let repos = load_repo_file(f.path()).unwrap();

        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0].branch.as_deref(), Some("develop"));
        assert_eq!(repos[0].product.as_deref(), Some("Billing"));
        assert_eq!(repos[0].name(), "billing");
        assert_eq!(repos[1].branch, None);
        assert_eq!(repos[1].name(), "web");
    }

    #[test]
    fn test_malformed_repo_file() {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, "{{\"repo\": 1}}").unwrap();
        assert!(load_repo_file(f.path()).is_err());
    }

    #[test]
    fn test_unique_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(unique_dir(dir.path(), "web"), dir.path().join("web"));
        std::fs::create_dir(dir.path().join("web")).unwrap();
        assert_eq!(unique_dir(dir.path(), "web"), dir.path().join("web_2"));
    }

    #[tokio::test]
    async fn test_failed_clone_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let entry = RepoEntry {
            repo: dir.path().join("no-such-repo").display().to_string(),
            branch: None,
            product: None,
        };

        let result = clone_repo(&entry, dir.path(), Duration::from_secs(30)).await;

        assert!(result.is_err());
        assert!(!dir.path().join("no-such-repo_2").exists());
    }
}
