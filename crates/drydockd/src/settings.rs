//! Daemon settings: TOML file + `DRYDOCK_*` environment + CLI flags.
//!
//! Resolution order is file < flag/env: the optional settings file fills
//! everything in, then the handful of common CLI flags override it. All
//! escalation thresholds and grace windows live here so nothing is
//! hardcoded at the call sites.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use drydock_healer::HealerConfig;
use drydock_orchestrator::OrchestratorConfig;

/// Which secrets backend to construct at startup.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum SecretsSettings {
    /// Parse a `.env`-style file once at startup.
    EnvFile { path: PathBuf },
    /// Resolve each key through an external lookup command.
    Exec { command: Vec<String> },
}

impl Default for SecretsSettings {
    fn default() -> Self {
        SecretsSettings::EnvFile {
            path: PathBuf::from(".env"),
        }
    }
}

/// All operator-tunable knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub listen_port: u16,
    pub data_dir: PathBuf,
    pub repos_dir: PathBuf,

    // Proxy
    pub sites_dir: PathBuf,
    pub domain_suffix: String,
    pub proxy_check_cmd: Vec<String>,
    pub proxy_reload_cmd: Vec<String>,

    // Ports handed to app containers
    pub port_range_start: u16,
    pub port_range_end: u16,

    // Subprocess bounds
    pub command_timeout_secs: u64,
    pub build_timeout_secs: u64,

    // Deploy pipeline
    pub deploy_timeout_secs: u64,
    pub health_grace_secs: u64,
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub probe_path: String,
    pub stop_grace_secs: u64,
    pub history_retention: usize,

    // Healer
    pub healer_interval_secs: u64,
    pub failure_threshold: u32,
    pub restart_backoff_secs: u64,
    pub restart_backoff_max_secs: u64,
    pub restart_ceiling: u32,
    pub restart_window_secs: u64,
    pub max_parallel_checks: usize,

    pub secrets: SecretsSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_port: 7070,
            data_dir: PathBuf::from("/var/lib/drydock"),
            repos_dir: PathBuf::from("/var/lib/drydock/repos"),
            sites_dir: PathBuf::from("/etc/nginx/conf.d/drydock"),
            domain_suffix: "localhost".to_string(),
            proxy_check_cmd: vec!["nginx".to_string(), "-t".to_string()],
            proxy_reload_cmd: vec![
                "nginx".to_string(),
                "-s".to_string(),
                "reload".to_string(),
            ],
            port_range_start: 8000,
            port_range_end: 9000,
            command_timeout_secs: 30,
            build_timeout_secs: 600,
            deploy_timeout_secs: 600,
            health_grace_secs: 30,
            probe_interval_secs: 2,
            probe_timeout_secs: 2,
            probe_path: "/".to_string(),
            stop_grace_secs: 10,
            history_retention: 10,
            healer_interval_secs: 10,
            failure_threshold: 3,
            restart_backoff_secs: 5,
            restart_backoff_max_secs: 60,
            restart_ceiling: 3,
            restart_window_secs: 600,
            max_parallel_checks: 4,
            secrets: SecretsSettings::default(),
        }
    }
}

impl Settings {
    /// Load from a TOML file, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Ok(toml::from_str(&raw)?)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            deploy_timeout: Duration::from_secs(self.deploy_timeout_secs),
            health_grace: Duration::from_secs(self.health_grace_secs),
            probe_interval: Duration::from_secs(self.probe_interval_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            probe_path: self.probe_path.clone(),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            history_retention: self.history_retention,
        }
    }

    pub fn healer_config(&self) -> HealerConfig {
        HealerConfig {
            interval: Duration::from_secs(self.healer_interval_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            probe_path: self.probe_path.clone(),
            failure_threshold: self.failure_threshold,
            restart_backoff_base: Duration::from_secs(self.restart_backoff_secs),
            restart_backoff_max: Duration::from_secs(self.restart_backoff_max_secs),
            restart_ceiling: self.restart_ceiling,
            restart_window: Duration::from_secs(self.restart_window_secs),
            max_parallel_checks: self.max_parallel_checks,
            stop_grace: Duration::from_secs(self.stop_grace_secs),
        }
    }
}
