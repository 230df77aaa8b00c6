//! The `ContainerEngine` trait and its docker CLI implementation.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use drydock_state::{HealthState, ManagedContainer, RuntimeStatus};

use crate::probe::{HttpProbe, http_probe, tcp_probe};

/// Marker label on every container this engine manages.
pub const LABEL_MANAGED: &str = "drydock.managed";
/// Label carrying the owning app's name.
pub const LABEL_APP: &str = "drydock.app";
/// Label carrying the deployment id that produced the container.
pub const LABEL_DEPLOYMENT: &str = "drydock.deployment";

/// Fallback when an image declares no exposed port.
const DEFAULT_CONTAINER_PORT: u16 = 8080;

/// Build-log lines kept when a build fails.
const BUILD_LOG_TAIL: usize = 40;

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors from container lifecycle operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("image build failed:\n{log}")]
    BuildFailed { log: String },

    #[error("container start rejected: {0}")]
    StartFailed(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("docker command failed: {0}")]
    CommandFailed(String),

    #[error("docker command timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything needed to start one container.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub app_name: String,
    pub deployment_id: u64,
    pub image_tag: String,
    pub host_port: u16,
    pub container_port: u16,
    /// Injected environment (already resolved from the secrets provider).
    pub env: Vec<(String, String)>,
}

/// What to probe for one container.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub container_id: String,
    /// Bound host port, when the container is port-mapped.
    pub host_port: Option<u16>,
    /// HTTP path for the probe (e.g. "/").
    pub path: String,
}

/// Low-level container lifecycle operations.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Build an image from a context directory. Returns the image ref.
    async fn build(&self, context_dir: &Path, tag: &str) -> EngineResult<String>;

    /// Start a detached, labeled, port-mapped container. Returns its id.
    async fn run(&self, spec: &RunSpec) -> EngineResult<String>;

    /// Stop a container. No-op if already stopped or absent.
    async fn stop(&self, container_id: &str, grace: Duration) -> EngineResult<()>;

    /// Remove a container. No-op if absent.
    async fn remove(&self, container_id: &str) -> EngineResult<()>;

    /// Stop-and-start the same container (healer restart path).
    async fn restart(&self, container_id: &str, grace: Duration) -> EngineResult<()>;

    /// Runtime status as reported by the container runtime.
    async fn inspect(&self, container_id: &str) -> EngineResult<RuntimeStatus>;

    /// Managed containers belonging to one app.
    async fn list_by_label(&self, app_name: &str) -> EngineResult<Vec<ManagedContainer>>;

    /// Every container this engine manages (process-restart recovery).
    async fn list_managed(&self) -> EngineResult<Vec<ManagedContainer>>;

    /// The port an image declares it listens on, with a conventional
    /// default when undeclared.
    async fn exposed_port(&self, image_tag: &str) -> EngineResult<u16>;

    /// Bounded health probe: runtime-reported health when declared, then
    /// HTTP against the bound port, then a bare TCP connect.
    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> HealthState;
}

// ── Docker CLI implementation ─────────────────────────────────────

/// `ContainerEngine` backed by the docker CLI.
pub struct DockerEngine {
    docker_bin: String,
    command_timeout: Duration,
    build_timeout: Duration,
}

impl DockerEngine {
    pub fn new(command_timeout: Duration, build_timeout: Duration) -> Self {
        Self {
            docker_bin: "docker".to_string(),
            command_timeout,
            build_timeout,
        }
    }

    /// Run docker with a timeout, returning the raw output.
    async fn run_docker(
        &self,
        args: &[&str],
        timeout: Duration,
    ) -> EngineResult<std::process::Output> {
        debug!(?args, "running docker");
        let output = tokio::time::timeout(
            timeout,
            Command::new(&self.docker_bin)
                .args(args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| EngineError::Timeout(timeout))??;
        Ok(output)
    }

    /// Run docker, mapping non-zero exit to `CommandFailed` and absent
    /// containers to `NotFound`. Returns trimmed stdout.
    async fn run_docker_checked(&self, args: &[&str]) -> EngineResult<String> {
        let output = self.run_docker(args, self.command_timeout).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_not_found(&stderr) {
                return Err(EngineError::NotFound(stderr));
            }
            return Err(EngineError::CommandFailed(stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Runtime-native health status, when the image declares a healthcheck.
    async fn native_health(&self, container_id: &str) -> EngineResult<Option<String>> {
        let out = self
            .run_docker_checked(&[
                "inspect",
                "-f",
                "{{if .State.Health}}{{.State.Health.Status}}{{end}}",
                container_id,
            ])
            .await?;
        Ok(if out.is_empty() { None } else { Some(out) })
    }

    async fn ps(&self, label_filter: &str) -> EngineResult<Vec<ManagedContainer>> {
        let out = self
            .run_docker_checked(&[
                "ps",
                "-a",
                "--filter",
                label_filter,
                "--format",
                "{{json .}}",
            ])
            .await?;
        Ok(out.lines().filter_map(parse_ps_line).collect())
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn build(&self, context_dir: &Path, tag: &str) -> EngineResult<String> {
        info!(%tag, context = %context_dir.display(), "building image");
        let context = context_dir.to_string_lossy().to_string();
        let output = self
            .run_docker(&["build", "-t", tag, &context], self.build_timeout)
            .await?;

        if !output.status.success() {
            // Docker interleaves build output across both streams; keep
            // the tail of each for the failure report.
            let mut log = String::from_utf8_lossy(&output.stdout).to_string();
            log.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(EngineError::BuildFailed {
                log: log_tail(&log, BUILD_LOG_TAIL),
            });
        }

        info!(%tag, "image built");
        Ok(tag.to_string())
    }

    async fn run(&self, spec: &RunSpec) -> EngineResult<String> {
        let args = run_args(spec);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run_docker(&arg_refs, self.command_timeout).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(EngineError::StartFailed(stderr));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(
            app = %spec.app_name,
            deployment = spec.deployment_id,
            container = %short_id(&container_id),
            host_port = spec.host_port,
            "container started"
        );
        Ok(container_id)
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> EngineResult<()> {
        let grace_secs = grace.as_secs().to_string();
        match self
            .run_docker_checked(&["stop", "-t", &grace_secs, container_id])
            .await
        {
            Ok(_) => {
                info!(container = %short_id(container_id), "container stopped");
                Ok(())
            }
            Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove(&self, container_id: &str) -> EngineResult<()> {
        match self.run_docker_checked(&["rm", "-f", container_id]).await {
            Ok(_) => {
                info!(container = %short_id(container_id), "container removed");
                Ok(())
            }
            Err(EngineError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn restart(&self, container_id: &str, grace: Duration) -> EngineResult<()> {
        let grace_secs = grace.as_secs().to_string();
        self.run_docker_checked(&["restart", "-t", &grace_secs, container_id])
            .await?;
        info!(container = %short_id(container_id), "container restarted");
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> EngineResult<RuntimeStatus> {
        let out = self
            .run_docker_checked(&["inspect", "-f", "{{.State.Status}}", container_id])
            .await?;
        Ok(parse_runtime_status(&out))
    }

    async fn list_by_label(&self, app_name: &str) -> EngineResult<Vec<ManagedContainer>> {
        self.ps(&format!("label={LABEL_APP}={app_name}")).await
    }

    async fn list_managed(&self) -> EngineResult<Vec<ManagedContainer>> {
        self.ps(&format!("label={LABEL_MANAGED}=true")).await
    }

    async fn exposed_port(&self, image_tag: &str) -> EngineResult<u16> {
        let out = self
            .run_docker_checked(&[
                "image",
                "inspect",
                "-f",
                "{{json .Config.ExposedPorts}}",
                image_tag,
            ])
            .await?;
        Ok(parse_exposed_ports(&out).unwrap_or(DEFAULT_CONTAINER_PORT))
    }

    async fn probe(&self, target: &ProbeTarget, timeout: Duration) -> HealthState {
        // Runtime-reported health wins when the image declares a check.
        match self.native_health(&target.container_id).await {
            Ok(Some(status)) if status == "healthy" => return HealthState::Healthy,
            Ok(Some(status)) if status == "unhealthy" => return HealthState::Unhealthy,
            Ok(_) => {}
            Err(EngineError::NotFound(_)) => return HealthState::Unhealthy,
            Err(e) => {
                warn!(container = %short_id(&target.container_id), error = %e, "health inspect failed");
            }
        }

        if let Some(port) = target.host_port {
            let address = format!("127.0.0.1:{port}");
            return match http_probe(&address, &target.path, timeout).await {
                // Anything the app answers itself counts as alive; only
                // server errors mark it unhealthy.
                HttpProbe::Status(code) if code < 500 => HealthState::Healthy,
                HttpProbe::Status(_) => HealthState::Unhealthy,
                HttpProbe::Failed => {
                    if tcp_probe(&address, timeout).await {
                        HealthState::Healthy
                    } else {
                        HealthState::Unhealthy
                    }
                }
            };
        }

        // No probe surface: trust the runtime status.
        match self.inspect(&target.container_id).await {
            Ok(RuntimeStatus::Running) => HealthState::Unknown,
            _ => HealthState::Unhealthy,
        }
    }
}

// ── Parsing helpers ───────────────────────────────────────────────

/// One line of `docker ps --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Image", default)]
    image: String,
    #[serde(rename = "Labels", default)]
    labels: String,
    #[serde(rename = "Ports", default)]
    ports: String,
    #[serde(rename = "State", default)]
    state: String,
}

fn parse_ps_line(line: &str) -> Option<ManagedContainer> {
    let ps: PsLine = serde_json::from_str(line).ok()?;
    let labels = parse_labels(&ps.labels);
    let app_name = labels.get(LABEL_APP)?.clone();
    let deployment_id = labels
        .get(LABEL_DEPLOYMENT)
        .and_then(|v| v.parse::<u64>().ok());

    Some(ManagedContainer {
        id: ps.id,
        app_name,
        deployment_id,
        image_tag: ps.image,
        host_port: parse_host_port(&ps.ports),
        runtime_status: parse_runtime_status(&ps.state),
    })
}

/// Parse docker's `k=v,k=v` label list.
fn parse_labels(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Pull the host port out of a docker port listing like
/// `0.0.0.0:8001->8080/tcp, :::8001->8080/tcp`.
fn parse_host_port(raw: &str) -> Option<u16> {
    for mapping in raw.split(',') {
        let Some((host_side, _)) = mapping.split_once("->") else {
            continue;
        };
        if let Some((_, port)) = host_side.trim().rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                return Some(port);
            }
        }
    }
    None
}

/// Parse `docker image inspect .Config.ExposedPorts` JSON, e.g.
/// `{"8080/tcp":{}}`. Returns the lowest declared port.
fn parse_exposed_ports(raw: &str) -> Option<u16> {
    let map: Option<HashMap<String, serde_json::Value>> = serde_json::from_str(raw).ok()?;
    map?.keys()
        .filter_map(|key| key.split('/').next()?.parse::<u16>().ok())
        .min()
}

fn parse_runtime_status(raw: &str) -> RuntimeStatus {
    match raw.trim() {
        "running" => RuntimeStatus::Running,
        "restarting" => RuntimeStatus::Restarting,
        "exited" | "created" | "paused" => RuntimeStatus::Exited,
        "dead" | "removing" => RuntimeStatus::Dead,
        _ => RuntimeStatus::Unknown,
    }
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

/// The argv for `docker run`, derived from a `RunSpec`.
fn run_args(spec: &RunSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        format!("{}-d{}", spec.app_name, spec.deployment_id),
        "--label".to_string(),
        format!("{LABEL_MANAGED}=true"),
        "--label".to_string(),
        format!("{LABEL_APP}={}", spec.app_name),
        "--label".to_string(),
        format!("{LABEL_DEPLOYMENT}={}", spec.deployment_id),
        "-p".to_string(),
        format!("{}:{}", spec.host_port, spec.container_port),
    ];
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push(spec.image_tag.clone());
    args
}

/// Keep the last `max_lines` of a build log.
fn log_tail(log: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = log.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

fn short_id(container_id: &str) -> &str {
    &container_id[..container_id.len().min(12)]
}
