//! The deployment error taxonomy.
//!
//! Every pipeline-stage failure maps to one variant; `reason()` feeds the
//! failure metrics and `exit_code()` gives CLI front-ends a stable 1:1
//! mapping.

use std::time::Duration;

use thiserror::Error;

use drydock_engine::PortError;
use drydock_proxy::ProxyError;
use drydock_secrets::SecretsError;
use drydock_source::SourceError;
use drydock_state::StateError;

/// Why a deployment (or an orchestrator operation) failed.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("build failed:\n{log}")]
    BuildFailed { log: String },

    #[error("start failed: {0}")]
    StartFailed(String),

    #[error("container did not become healthy within {0:?}")]
    HealthCheckTimeout(Duration),

    #[error("route sync failed: {0}")]
    RouteSyncFailed(String),

    #[error("a deployment is already in progress for {0}")]
    DeploymentInProgress(String),

    #[error("secret unavailable: {0}")]
    SecretUnavailable(String),

    #[error("no free host ports left")]
    PortExhausted,

    #[error("invalid app name: {0:?}")]
    InvalidAppName(String),

    #[error("app not found: {0}")]
    AppNotFound(String),

    #[error("deployment aborted after {0:?}")]
    Aborted(Duration),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Stable label for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            DeployError::SourceUnavailable(_) => "source_unavailable",
            DeployError::BuildFailed { .. } => "build_failed",
            DeployError::StartFailed(_) => "start_failed",
            DeployError::HealthCheckTimeout(_) => "health_check_timeout",
            DeployError::RouteSyncFailed(_) => "route_sync_failed",
            DeployError::DeploymentInProgress(_) => "deployment_in_progress",
            DeployError::SecretUnavailable(_) => "secret_unavailable",
            DeployError::PortExhausted => "port_exhausted",
            DeployError::InvalidAppName(_) => "invalid_app_name",
            DeployError::AppNotFound(_) => "app_not_found",
            DeployError::Aborted(_) => "aborted",
            DeployError::Internal(_) => "internal",
        }
    }

    /// Exit code for CLI front-ends, 1:1 with the taxonomy.
    pub fn exit_code(&self) -> i32 {
        match self {
            DeployError::SourceUnavailable(_) => 10,
            DeployError::BuildFailed { .. } => 11,
            DeployError::StartFailed(_) => 12,
            DeployError::HealthCheckTimeout(_) => 13,
            DeployError::RouteSyncFailed(_) => 14,
            DeployError::DeploymentInProgress(_) => 15,
            DeployError::SecretUnavailable(_) => 16,
            DeployError::PortExhausted => 17,
            DeployError::InvalidAppName(_) => 18,
            DeployError::AppNotFound(_) => 19,
            DeployError::Aborted(_) => 20,
            DeployError::Internal(_) => 1,
        }
    }
}

impl From<StateError> for DeployError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::InvalidAppName(name) => DeployError::InvalidAppName(name),
            other => DeployError::Internal(other.to_string()),
        }
    }
}

impl From<SourceError> for DeployError {
    fn from(err: SourceError) -> Self {
        DeployError::SourceUnavailable(err.to_string())
    }
}

impl From<SecretsError> for DeployError {
    fn from(err: SecretsError) -> Self {
        match err {
            SecretsError::Unavailable(key) => DeployError::SecretUnavailable(key),
            other => DeployError::Internal(other.to_string()),
        }
    }
}

impl From<ProxyError> for DeployError {
    fn from(err: ProxyError) -> Self {
        DeployError::RouteSyncFailed(err.to_string())
    }
}

impl From<PortError> for DeployError {
    fn from(_: PortError) -> Self {
        DeployError::PortExhausted
    }
}
