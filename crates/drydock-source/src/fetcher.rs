//! Git fetcher — clone-or-update with a resolved commit SHA.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Result type alias for source operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors that can occur while fetching source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The remote is unreachable or the ref does not exist.
    #[error("source unavailable for {app}: {detail}")]
    Unavailable { app: String, detail: String },

    #[error("git command failed: {0}")]
    CommandFailed(String),

    #[error("git command timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A checked-out working tree and its resolved commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkout {
    pub workdir: PathBuf,
    pub commit_sha: String,
}

/// Produces a build-ready working directory for an app.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Clone or update the app's repository and resolve the branch head.
    async fn sync(&self, app_name: &str, repo_url: &str, branch: &str) -> SourceResult<Checkout>;

    /// Delete the cached clone for an app. No-op if absent.
    async fn remove(&self, app_name: &str) -> SourceResult<()>;
}

/// Git-backed fetcher keeping one clone per app under `repos_dir`.
pub struct GitFetcher {
    repos_dir: PathBuf,
    command_timeout: Duration,
}

impl GitFetcher {
    pub fn new(repos_dir: impl Into<PathBuf>, command_timeout: Duration) -> Self {
        Self {
            repos_dir: repos_dir.into(),
            command_timeout,
        }
    }

    /// The clone directory for an app.
    pub fn workdir(&self, app_name: &str) -> PathBuf {
        self.repos_dir.join(app_name)
    }

    /// Run git with the configured timeout, returning trimmed stdout.
    async fn run_git(&self, cwd: Option<&Path>, args: &[&str]) -> SourceResult<String> {
        let mut cmd = Command::new("git");
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!(?args, "running git");
        let output = tokio::time::timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| SourceError::Timeout(self.command_timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(SourceError::CommandFailed(stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SourceFetcher for GitFetcher {
    async fn sync(&self, app_name: &str, repo_url: &str, branch: &str) -> SourceResult<Checkout> {
        let dest = self.workdir(app_name);
        tokio::fs::create_dir_all(&self.repos_dir).await?;

        if dest.join(".git").exists() {
            debug!(app = %app_name, %branch, "updating existing clone");
            // Fetch then hard-reset: the working tree always matches the
            // remote branch head, even after force pushes.
            self.run_git(Some(&dest), &["fetch", "origin", branch])
                .await
                .map_err(|e| unavailable(app_name, e))?;
            self.run_git(
                Some(&dest),
                &["reset", "--hard", &format!("origin/{branch}")],
            )
            .await?;
        } else {
            info!(app = %app_name, %repo_url, %branch, "cloning repository");
            let dest_str = dest.to_string_lossy().to_string();
            self.run_git(None, &["clone", "--branch", branch, repo_url, &dest_str])
                .await
                .map_err(|e| unavailable(app_name, e))?;
        }

        let commit_sha = self.run_git(Some(&dest), &["rev-parse", "HEAD"]).await?;
        info!(app = %app_name, sha = %commit_sha, "source synced");

        Ok(Checkout {
            workdir: dest,
            commit_sha,
        })
    }

    async fn remove(&self, app_name: &str) -> SourceResult<()> {
        let dest = self.workdir(app_name);
        if dest.exists() {
            tokio::fs::remove_dir_all(&dest).await?;
            info!(app = %app_name, "cached clone removed");
        }
        Ok(())
    }
}

/// Fold a clone/fetch failure into `Unavailable`: either the remote is
/// unreachable or the ref does not exist.
fn unavailable(app_name: &str, err: SourceError) -> SourceError {
    match err {
        SourceError::CommandFailed(detail) => SourceError::Unavailable {
            app: app_name.to_string(),
            detail,
        },
        other => other,
    }
}
