//! Atomic route synchronization against the proxy's sites directory.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::render::{fingerprint, render_server_block};

/// Result type alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors from route synchronization.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Validation or reload failed; the previous configuration remains active.
    #[error("route sync failed for {app}: {detail}")]
    RouteSyncFailed { app: String, detail: String },

    #[error("invalid app name for route: {0:?}")]
    InvalidApp(String),

    #[error("proxy command timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What a `sync` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The rule changed and the proxy was reloaded.
    Updated,
    /// The rendered rule matched the active one; nothing touched.
    Unchanged,
}

/// Routes public traffic for apps to their current backend port.
#[async_trait]
pub trait ProxyRouter: Send + Sync {
    /// Point the app's public address at `target_port`.
    async fn sync(&self, app_name: &str, target_port: u16) -> ProxyResult<SyncOutcome>;

    /// Delete the app's rule. No-op if absent.
    async fn remove(&self, app_name: &str) -> ProxyResult<()>;
}

/// `ProxyRouter` writing nginx `server` blocks into a sites directory.
///
/// The check and reload argv are configurable so tests can script
/// success and failure; production uses `nginx -t` / `nginx -s reload`.
pub struct NginxProxy {
    sites_dir: PathBuf,
    domain_suffix: String,
    check_cmd: Vec<String>,
    reload_cmd: Vec<String>,
    command_timeout: Duration,
}

impl NginxProxy {
    pub fn new(
        sites_dir: impl Into<PathBuf>,
        domain_suffix: &str,
        check_cmd: Vec<String>,
        reload_cmd: Vec<String>,
        command_timeout: Duration,
    ) -> Self {
        Self {
            sites_dir: sites_dir.into(),
            domain_suffix: domain_suffix.to_string(),
            check_cmd,
            reload_cmd,
            command_timeout,
        }
    }

    /// Production defaults: `nginx -t` and `nginx -s reload`.
    pub fn with_nginx_defaults(
        sites_dir: impl Into<PathBuf>,
        domain_suffix: &str,
        command_timeout: Duration,
    ) -> Self {
        Self::new(
            sites_dir,
            domain_suffix,
            vec!["nginx".to_string(), "-t".to_string()],
            vec!["nginx".to_string(), "-s".to_string(), "reload".to_string()],
            command_timeout,
        )
    }

    fn conf_path(&self, app_name: &str) -> ProxyResult<PathBuf> {
        if app_name.is_empty() || app_name.contains('/') || app_name.contains("..") {
            return Err(ProxyError::InvalidApp(app_name.to_string()));
        }
        Ok(self.sites_dir.join(format!("{app_name}.conf")))
    }

    async fn run_cmd(&self, argv: &[String]) -> ProxyResult<Result<(), String>> {
        let Some((bin, args)) = argv.split_first() else {
            // No command configured: treat the step as a no-op success.
            return Ok(Ok(()));
        };
        let output = tokio::time::timeout(
            self.command_timeout,
            Command::new(bin)
                .args(args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| ProxyError::Timeout(self.command_timeout))??;

        if output.status.success() {
            Ok(Ok(()))
        } else {
            Ok(Err(String::from_utf8_lossy(&output.stderr)
                .trim()
                .to_string()))
        }
    }
}

#[async_trait]
impl ProxyRouter for NginxProxy {
    async fn sync(&self, app_name: &str, target_port: u16) -> ProxyResult<SyncOutcome> {
        let active = self.conf_path(app_name)?;
        let rendered = render_server_block(app_name, target_port, &self.domain_suffix);

        tokio::fs::create_dir_all(&self.sites_dir).await?;

        // Unchanged rule: skip the swap and the reload entirely.
        if let Ok(existing) = tokio::fs::read_to_string(&active).await {
            if fingerprint(&existing) == fingerprint(&rendered) {
                debug!(app = %app_name, port = target_port, "route unchanged");
                return Ok(SyncOutcome::Unchanged);
            }
        }

        // Stage next to the active file so the rename stays on one
        // filesystem and is atomic.
        let staged = self.sites_dir.join(format!("{app_name}.conf.staged"));
        tokio::fs::write(&staged, &rendered).await?;

        if let Err(detail) = self.run_cmd(&self.check_cmd).await? {
            let _ = tokio::fs::remove_file(&staged).await;
            warn!(app = %app_name, %detail, "config check rejected staged route");
            return Err(ProxyError::RouteSyncFailed {
                app: app_name.to_string(),
                detail,
            });
        }

        // Keep the previous rule so a failed reload can roll back.
        let previous = tokio::fs::read_to_string(&active).await.ok();

        tokio::fs::rename(&staged, &active).await?;

        if let Err(detail) = self.run_cmd(&self.reload_cmd).await? {
            match &previous {
                Some(content) => tokio::fs::write(&active, content).await?,
                None => {
                    let _ = tokio::fs::remove_file(&active).await;
                }
            }
            warn!(app = %app_name, %detail, "proxy reload failed, previous route restored");
            return Err(ProxyError::RouteSyncFailed {
                app: app_name.to_string(),
                detail,
            });
        }

        info!(app = %app_name, port = target_port, "route synced");
        Ok(SyncOutcome::Updated)
    }

    async fn remove(&self, app_name: &str) -> ProxyResult<()> {
        let active = self.conf_path(app_name)?;
        if !active.exists() {
            return Ok(());
        }

        tokio::fs::remove_file(&active).await?;
        if let Err(detail) = self.run_cmd(&self.reload_cmd).await? {
            return Err(ProxyError::RouteSyncFailed {
                app: app_name.to_string(),
                detail,
            });
        }
        info!(app = %app_name, "route removed");
        Ok(())
    }
}
