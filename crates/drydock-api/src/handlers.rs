//! REST API handlers.
//!
//! Each handler reads via the registry/history and returns a JSON
//! envelope; mutations go through the `DeployApi` seam.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tracing::debug;

use drydock_orchestrator::{DeployError, DeployRequest};
use drydock_state::HealthState;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> axum::response::Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Map the deployment error taxonomy onto HTTP statuses.
fn status_for(err: &DeployError) -> StatusCode {
    match err {
        DeployError::DeploymentInProgress(_) => StatusCode::CONFLICT,
        DeployError::InvalidAppName(_) => StatusCode::BAD_REQUEST,
        DeployError::AppNotFound(_) => StatusCode::NOT_FOUND,
        DeployError::SourceUnavailable(_) | DeployError::SecretUnavailable(_) => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ── Deploy ─────────────────────────────────────────────────────────

/// Body of `POST /api/v1/apps/{name}/deploy`.
#[derive(Deserialize)]
pub struct DeployBody {
    pub repo_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub env_keys: Vec<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

/// POST /api/v1/apps/{name}/deploy
///
/// Synchronous acceptance: the response carries the terminal deployment
/// record, or 409 when another deploy for the app is in flight.
pub async fn deploy_app(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(body): Json<DeployBody>,
) -> impl IntoResponse {
    debug!(app = %name, repo = %body.repo_url, branch = %body.branch, "deploy requested");
    let req = DeployRequest {
        app_name: name,
        repo_url: body.repo_url,
        branch: body.branch,
        env_keys: body.env_keys,
    };
    match state.deployer.deploy(req).await {
        Ok(deployment) => (StatusCode::ACCEPTED, ApiResponse::ok(deployment)).into_response(),
        Err(e) => error_response(&e.to_string(), status_for(&e)),
    }
}

// ── Status polling ─────────────────────────────────────────────────

/// GET /api/v1/apps
pub async fn list_apps(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.registry.snapshots().await)
}

/// GET /api/v1/apps/{name}
pub async fn get_app(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&name).await {
        Some(entry) => ApiResponse::ok(entry.snapshot().await).into_response(),
        None => error_response("app not found", StatusCode::NOT_FOUND),
    }
}

/// GET /api/v1/apps/{name}/deployments
pub async fn list_deployments(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.history.list_for_app(&name) {
        Ok(deployments) => ApiResponse::ok(deployments).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// DELETE /api/v1/apps/{name}
pub async fn remove_app(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.deployer.remove_app(&name).await {
        Ok(()) => ApiResponse::ok("removed").into_response(),
        Err(e) => error_response(&e.to_string(), status_for(&e)),
    }
}

// ── Routing table ──────────────────────────────────────────────────

/// One row of the routing table exposed for observability tooling.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct RouteEntry {
    pub app: String,
    pub host_port: u16,
    pub health: HealthState,
}

/// GET /api/v1/routes
pub async fn routing_table(State(state): State<ApiState>) -> impl IntoResponse {
    let routes: Vec<RouteEntry> = state
        .registry
        .snapshots()
        .await
        .into_iter()
        .filter_map(|app| {
            app.host_port.map(|port| RouteEntry {
                app: app.name,
                host_port: port,
                health: app.health,
            })
        })
        .collect();
    ApiResponse::ok(routes)
}

// ── Metrics ────────────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    state.metrics.set_active_apps(state.registry.running_count().await);
    state.metrics.render_prometheus()
}
