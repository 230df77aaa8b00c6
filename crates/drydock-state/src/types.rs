//! Domain types for Drydock.
//!
//! These types represent apps, their deployments, and the read-through
//! container view. All types serialize to/from JSON for the history store
//! and the status API.

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

// ── App ───────────────────────────────────────────────────────────

/// Where an app's source lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppSource {
    pub repo_url: String,
    pub branch: String,
}

/// Whether an app should be running at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Stopped,
}

/// Health as determined by probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

/// One deployable application.
///
/// At most one deployment is routed at a time; `current_deployment` is
/// swapped only after a new deployment passes its health gate and the
/// proxy has been retargeted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub name: String,
    pub source: AppSource,
    pub desired_state: DesiredState,
    /// The deployment currently routed through the proxy, if any.
    pub current_deployment: Option<Deployment>,
    /// The host port the proxy currently targets, if routed.
    pub host_port: Option<u16>,
    pub health: HealthState,
    /// Consecutive failed probes, reset to 0 on recovery.
    pub consecutive_failures: u32,
    /// Restarts attempted by the healer within the rolling window.
    pub restart_count: u32,
    /// Unix timestamp of the healer's last restart attempt.
    pub last_restart_at: Option<u64>,
    /// Set when the healer has exhausted its escalation ladder; the app
    /// is left for operator intervention until the next deploy succeeds.
    pub halted_at: Option<u64>,
    /// Secret keys injected into build/runtime environment.
    pub env_keys: Vec<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl App {
    /// Create a fresh app record with no deployment yet.
    pub fn new(name: &str, source: AppSource) -> Self {
        let now = epoch_secs();
        Self {
            name: name.to_string(),
            source,
            desired_state: DesiredState::Running,
            current_deployment: None,
            host_port: None,
            health: HealthState::Unknown,
            consecutive_failures: 0,
            restart_count: 0,
            last_restart_at: None,
            halted_at: None,
            env_keys: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Deployment ────────────────────────────────────────────────────

/// Lifecycle status of one build/run attempt.
///
/// Transitions only move forward; `Failed` is reachable from any
/// non-terminal state. `Complete` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Queued,
    Cloning,
    Building,
    Starting,
    Routing,
    Complete,
    Failed,
}

impl DeploymentStatus {
    /// Whether this status accepts no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentStatus::Complete | DeploymentStatus::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            DeploymentStatus::Queued => 0,
            DeploymentStatus::Cloning => 1,
            DeploymentStatus::Building => 2,
            DeploymentStatus::Starting => 3,
            DeploymentStatus::Routing => 4,
            DeploymentStatus::Complete => 5,
            DeploymentStatus::Failed => 6,
        }
    }
}

/// One attempt to build and run a new version of an app.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    /// Monotonic per-app id, allocated by the history store.
    pub id: u64,
    pub app_name: String,
    pub commit_sha: String,
    pub image_tag: String,
    pub status: DeploymentStatus,
    /// Set once a container has been started for this deployment.
    pub container_id: Option<String>,
    /// Failure detail when `status` is `Failed`.
    pub error: Option<String>,
    pub queued_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

impl Deployment {
    /// Create a queued deployment record.
    pub fn queued(id: u64, app_name: &str, commit_sha: &str, image_tag: &str) -> Self {
        Self {
            id,
            app_name: app_name.to_string(),
            commit_sha: commit_sha.to_string(),
            image_tag: image_tag.to_string(),
            status: DeploymentStatus::Queued,
            container_id: None,
            error: None,
            queued_at: epoch_secs(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Advance the status, enforcing forward-only movement.
    ///
    /// Skipping intermediate states is allowed (the recreate path goes
    /// `Queued -> Starting`), moving backwards or out of a terminal state
    /// is not. Timestamps are stamped on the first forward move and on
    /// reaching a terminal state.
    pub fn advance(&mut self, next: DeploymentStatus) -> StateResult<()> {
        if self.status.is_terminal() || next.rank() <= self.status.rank() {
            return Err(StateError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        if self.started_at.is_none() && next != DeploymentStatus::Failed {
            self.started_at = Some(epoch_secs());
        }
        if next.is_terminal() {
            self.finished_at = Some(epoch_secs());
        }
        self.status = next;
        Ok(())
    }

    /// Mark this deployment failed with the given error detail.
    pub fn fail(&mut self, error: &str) -> StateResult<()> {
        self.advance(DeploymentStatus::Failed)?;
        self.error = Some(error.to_string());
        Ok(())
    }

    /// Composite key for the history table.
    pub fn table_key(&self) -> String {
        deployment_key(&self.app_name, self.id)
    }
}

/// Build the zero-padded history key for an app's deployment.
///
/// Padding keeps lexicographic table order equal to numeric id order.
pub fn deployment_key(app_name: &str, id: u64) -> String {
    format!("{app_name}:{id:08}")
}

// ── ManagedContainer ──────────────────────────────────────────────

/// Runtime status reported by the container engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    Running,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

/// Read-through view of a container the engine manages.
///
/// Identity is recovered from labels (`drydock.app`, `drydock.deployment`)
/// so apps survive a restart of the coordinating process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagedContainer {
    pub id: String,
    pub app_name: String,
    pub deployment_id: Option<u64>,
    pub image_tag: String,
    pub host_port: Option<u16>,
    pub runtime_status: RuntimeStatus,
}

// ── Helpers ───────────────────────────────────────────────────────

/// Validate an app name before it reaches a path or subprocess argument.
pub fn validate_app_name(name: &str) -> StateResult<()> {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,62}$").unwrap());
    if re.is_match(name) {
        Ok(())
    } else {
        Err(StateError::InvalidAppName(name.to_string()))
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
