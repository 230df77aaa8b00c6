//! drydock-api — the REST surface webhook handlers and CLIs consume.
//!
//! Transport authentication lives in front of this router (reverse proxy
//! or API gateway); the handlers themselves are the narrow interface:
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/apps/{name}/deploy` | Queue a deployment (202/409) |
//! | GET | `/api/v1/apps` | List app status |
//! | GET | `/api/v1/apps/{name}` | One app's status |
//! | GET | `/api/v1/apps/{name}/deployments` | Deployment history |
//! | DELETE | `/api/v1/apps/{name}` | Remove an app |
//! | GET | `/api/v1/routes` | Routing table (app → port/health) |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::routing::{get, post};

use drydock_metrics::Metrics;
use drydock_orchestrator::{DeployError, DeployRequest, Orchestrator};
use drydock_state::{AppRegistry, Deployment, HistoryStore};

/// The orchestrator operations the API invokes.
///
/// A trait seam so handler tests can script outcomes without a full
/// pipeline behind them.
#[async_trait]
pub trait DeployApi: Send + Sync {
    async fn deploy(&self, req: DeployRequest) -> Result<Deployment, DeployError>;
    async fn remove_app(&self, app_name: &str) -> Result<(), DeployError>;
}

#[async_trait]
impl DeployApi for Orchestrator {
    async fn deploy(&self, req: DeployRequest) -> Result<Deployment, DeployError> {
        Orchestrator::deploy(self, req).await
    }

    async fn remove_app(&self, app_name: &str) -> Result<(), DeployError> {
        Orchestrator::remove_app(self, app_name).await
    }
}

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<AppRegistry>,
    pub history: HistoryStore,
    pub deployer: Arc<dyn DeployApi>,
    pub metrics: Arc<Metrics>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/apps", get(handlers::list_apps))
        .route(
            "/apps/{name}",
            get(handlers::get_app).delete(handlers::remove_app),
        )
        .route("/apps/{name}/deploy", post(handlers::deploy_app))
        .route("/apps/{name}/deployments", get(handlers::list_deployments))
        .route("/routes", get(handlers::routing_table))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
