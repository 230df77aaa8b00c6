//! The deployment pipeline and its recreate/remove/recover entry points.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use secrecy::ExposeSecret;
use tokio::time::Instant;
use tracing::{info, warn};

use drydock_engine::{ContainerEngine, PortAllocator, ProbeTarget, RunSpec};
use drydock_metrics::Metrics;
use drydock_proxy::ProxyRouter;
use drydock_secrets::SecretsProvider;
use drydock_source::SourceFetcher;
use drydock_state::{
    AppEntry, AppRegistry, AppSource, Deployment, DeploymentStatus, DesiredState, HealthState,
    HistoryStore, validate_app_name,
};

use crate::error::DeployError;

/// Inbound deploy request, as handed over by the webhook/API layer.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub app_name: String,
    pub repo_url: String,
    pub branch: String,
    /// Secret keys to resolve and inject into build/runtime environment.
    pub env_keys: Vec<String>,
}

/// Operator-tunable pipeline knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Overall deadline for one deployment attempt.
    pub deploy_timeout: Duration,
    /// Window a new container gets to reach HEALTHY before the attempt fails.
    pub health_grace: Duration,
    /// Pause between health-gate probes.
    pub probe_interval: Duration,
    /// Timeout for a single probe.
    pub probe_timeout: Duration,
    /// HTTP path probed on the app.
    pub probe_path: String,
    /// Grace period when stopping containers.
    pub stop_grace: Duration,
    /// Deployment records retained per app.
    pub history_retention: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            deploy_timeout: Duration::from_secs(600),
            health_grace: Duration::from_secs(30),
            probe_interval: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(2),
            probe_path: "/".to_string(),
            stop_grace: Duration::from_secs(10),
            history_retention: 10,
        }
    }
}

/// Resources created by an in-flight attempt, torn down if it fails.
#[derive(Default)]
struct Cleanup {
    container_id: Option<String>,
    host_port: Option<u16>,
}

/// The recreate entry point the healer escalates through.
#[async_trait::async_trait]
pub trait RecreateDeployment: Send + Sync {
    async fn recreate(&self, app_name: &str) -> Result<Deployment, DeployError>;
}

/// Drives deployments; the only writer of `Deployment` records.
pub struct Orchestrator {
    registry: Arc<AppRegistry>,
    history: HistoryStore,
    source: Arc<dyn SourceFetcher>,
    engine: Arc<dyn ContainerEngine>,
    proxy: Arc<dyn ProxyRouter>,
    secrets: Arc<dyn SecretsProvider>,
    ports: Arc<PortAllocator>,
    metrics: Arc<Metrics>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AppRegistry>,
        history: HistoryStore,
        source: Arc<dyn SourceFetcher>,
        engine: Arc<dyn ContainerEngine>,
        proxy: Arc<dyn ProxyRouter>,
        secrets: Arc<dyn SecretsProvider>,
        ports: Arc<PortAllocator>,
        metrics: Arc<Metrics>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            history,
            source,
            engine,
            proxy,
            secrets,
            ports,
            metrics,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<AppRegistry> {
        &self.registry
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    // ── Deploy ─────────────────────────────────────────────────────

    /// Run the full pipeline for one deploy request.
    ///
    /// Returns the terminal `Deployment` record on success; on failure
    /// the previously routed deployment keeps serving untouched.
    pub async fn deploy(&self, req: DeployRequest) -> Result<Deployment, DeployError> {
        validate_app_name(&req.app_name)?;

        let entry = self
            .registry
            .ensure(
                &req.app_name,
                AppSource {
                    repo_url: req.repo_url.clone(),
                    branch: req.branch.clone(),
                },
            )
            .await?;
        entry
            .update(|app| {
                app.env_keys = req.env_keys.clone();
                app.desired_state = DesiredState::Running;
            })
            .await;
        self.history.put_app(&entry.snapshot().await)?;
        self.metrics
            .set_active_apps(self.registry.running_count().await);

        // Single-flight: lose the race, get rejected immediately.
        let Some(_guard) = entry.try_deploy_lock() else {
            return Err(DeployError::DeploymentInProgress(req.app_name.clone()));
        };

        let id = self.history.next_id(&req.app_name)?;
        let mut deployment = Deployment::queued(id, &req.app_name, "", "");
        self.history.put(&deployment)?;
        info!(app = %req.app_name, deployment = id, "deployment queued");

        let cleanup = Mutex::new(Cleanup::default());
        let driven = tokio::time::timeout(
            self.config.deploy_timeout,
            self.drive_full(&entry, &req, &mut deployment, &cleanup),
        )
        .await
        .unwrap_or(Err(DeployError::Aborted(self.config.deploy_timeout)));

        self.finish(entry.name(), deployment, driven, &cleanup).await
    }

    /// Recreate the app from its last known-good image: STARTING → ROUTING
    /// with the same zero-downtime sequencing, no clone or build.
    pub async fn recreate(&self, app_name: &str) -> Result<Deployment, DeployError> {
        let entry = self
            .registry
            .get(app_name)
            .await
            .ok_or_else(|| DeployError::AppNotFound(app_name.to_string()))?;

        let Some(_guard) = entry.try_deploy_lock() else {
            return Err(DeployError::DeploymentInProgress(app_name.to_string()));
        };

        let known_good = self.history.latest_complete(app_name)?.ok_or_else(|| {
            DeployError::Internal(format!("no known-good deployment for {app_name}"))
        })?;

        let id = self.history.next_id(app_name)?;
        let mut deployment = Deployment::queued(
            id,
            app_name,
            &known_good.commit_sha,
            &known_good.image_tag,
        );
        self.history.put(&deployment)?;
        info!(app = %app_name, deployment = id, image = %known_good.image_tag, "recreate queued");

        let cleanup = Mutex::new(Cleanup::default());
        let driven = tokio::time::timeout(
            self.config.deploy_timeout,
            self.drive_recreate(&entry, &mut deployment, &cleanup),
        )
        .await
        .unwrap_or(Err(DeployError::Aborted(self.config.deploy_timeout)));

        self.finish(app_name, deployment, driven, &cleanup).await
    }

    /// Tear down an app entirely: containers, route, cached clone, state.
    pub async fn remove_app(&self, app_name: &str) -> Result<(), DeployError> {
        let entry = self
            .registry
            .get(app_name)
            .await
            .ok_or_else(|| DeployError::AppNotFound(app_name.to_string()))?;

        let Some(_guard) = entry.try_deploy_lock() else {
            return Err(DeployError::DeploymentInProgress(app_name.to_string()));
        };

        if let Ok(containers) = self.engine.list_by_label(app_name).await {
            for container in containers {
                self.retire_container(&container.id).await;
            }
        }
        if let Err(e) = self.proxy.remove(app_name).await {
            warn!(app = %app_name, error = %e, "route removal failed during app removal");
        }
        if let Err(e) = self.source.remove(app_name).await {
            warn!(app = %app_name, error = %e, "clone removal failed during app removal");
        }

        let app = entry.snapshot().await;
        if let Some(port) = app.host_port {
            self.ports.release(port);
        }

        self.history.delete_for_app(app_name)?;
        self.history.delete_app(app_name)?;
        self.registry.remove(app_name).await;
        self.metrics
            .set_active_apps(self.registry.running_count().await);

        info!(app = %app_name, "app removed");
        Ok(())
    }

    /// Rebuild the registry from persisted app records after a process
    /// restart, re-reserving the ports their containers still hold.
    ///
    /// Container identity comes back through the engine's label lookup on
    /// the next healer cycle; anything that died while we were down is
    /// repaired there.
    pub async fn recover(&self) -> Result<u32, DeployError> {
        let mut recovered = 0;
        for app in self.history.list_apps()? {
            if self.registry.get(&app.name).await.is_some() {
                continue;
            }
            if let Some(port) = app.host_port {
                self.ports.mark_reserved(port);
            }
            info!(app = %app.name, port = ?app.host_port, "app recovered from store");
            self.registry.insert(app).await;
            recovered += 1;
        }
        self.metrics
            .set_active_apps(self.registry.running_count().await);
        Ok(recovered)
    }

    // ── Pipeline stages ────────────────────────────────────────────

    /// CLONING → BUILDING → STARTING → ROUTING → COMPLETE.
    async fn drive_full(
        &self,
        entry: &Arc<AppEntry>,
        req: &DeployRequest,
        deployment: &mut Deployment,
        cleanup: &Mutex<Cleanup>,
    ) -> Result<(), DeployError> {
        deployment.advance(DeploymentStatus::Cloning)?;
        self.history.put(deployment)?;
        let checkout = self
            .source
            .sync(&req.app_name, &req.repo_url, &req.branch)
            .await?;
        deployment.commit_sha = checkout.commit_sha.clone();
        deployment.image_tag = image_tag(&req.app_name, &checkout.commit_sha);

        deployment.advance(DeploymentStatus::Building)?;
        self.history.put(deployment)?;
        // Secrets are resolved before the build so a missing key fails
        // here instead of starting an app with half a config.
        let env = self.resolve_env(&req.env_keys).await?;
        self.engine
            .build(&checkout.workdir, &deployment.image_tag)
            .await
            .map_err(|e| match e {
                drydock_engine::EngineError::BuildFailed { log } => {
                    DeployError::BuildFailed { log }
                }
                other => DeployError::BuildFailed {
                    log: other.to_string(),
                },
            })?;

        self.start_and_route(entry, deployment, env, cleanup).await
    }

    /// STARTING → ROUTING → COMPLETE from an already-built image.
    async fn drive_recreate(
        &self,
        entry: &Arc<AppEntry>,
        deployment: &mut Deployment,
        cleanup: &Mutex<Cleanup>,
    ) -> Result<(), DeployError> {
        let env_keys = entry.snapshot().await.env_keys;
        let env = self.resolve_env(&env_keys).await?;
        self.start_and_route(entry, deployment, env, cleanup).await
    }

    /// Start the new container, gate on health, retarget the proxy, and
    /// only then retire the previous container. The previously routed
    /// deployment is untouched until the proxy sync has succeeded.
    async fn start_and_route(
        &self,
        entry: &Arc<AppEntry>,
        deployment: &mut Deployment,
        env: Vec<(String, String)>,
        cleanup: &Mutex<Cleanup>,
    ) -> Result<(), DeployError> {
        deployment.advance(DeploymentStatus::Starting)?;
        self.history.put(deployment)?;

        let container_port = self
            .engine
            .exposed_port(&deployment.image_tag)
            .await
            .map_err(|e| DeployError::StartFailed(e.to_string()))?;
        let host_port = self.ports.allocate()?;
        cleanup.lock().unwrap_or_else(|e| e.into_inner()).host_port = Some(host_port);

        let spec = RunSpec {
            app_name: deployment.app_name.clone(),
            deployment_id: deployment.id,
            image_tag: deployment.image_tag.clone(),
            host_port,
            container_port,
            env,
        };
        let container_id = self
            .engine
            .run(&spec)
            .await
            .map_err(|e| DeployError::StartFailed(e.to_string()))?;
        cleanup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .container_id = Some(container_id.clone());
        deployment.container_id = Some(container_id.clone());
        self.history.put(deployment)?;

        self.await_healthy(&container_id, host_port).await?;

        deployment.advance(DeploymentStatus::Routing)?;
        self.history.put(deployment)?;
        self.proxy.sync(&deployment.app_name, host_port).await?;

        // COMPLETE — the only point where the app's routing state changes.
        deployment.advance(DeploymentStatus::Complete)?;
        let (old_deployment, old_port) = entry
            .update(|app| {
                let old = app.current_deployment.replace(deployment.clone());
                let old_port = app.host_port.replace(host_port);
                app.health = HealthState::Healthy;
                app.consecutive_failures = 0;
                app.restart_count = 0;
                app.last_restart_at = None;
                app.halted_at = None;
                (old, old_port)
            })
            .await;
        self.history.put_app(&entry.snapshot().await)?;

        // Traffic has moved; the attempt's resources are now the app's.
        *cleanup.lock().unwrap_or_else(|e| e.into_inner()) = Cleanup::default();

        if let Some(old) = old_deployment {
            if let Some(old_id) = &old.container_id {
                self.retire_container(old_id).await;
            }
        }
        if let Some(port) = old_port {
            if port != host_port {
                self.ports.release(port);
            }
        }

        info!(
            app = %deployment.app_name,
            deployment = deployment.id,
            port = host_port,
            "deployment complete"
        );
        Ok(())
    }

    /// Wait for the new container to reach HEALTHY within the grace window.
    async fn await_healthy(&self, container_id: &str, host_port: u16) -> Result<(), DeployError> {
        let target = ProbeTarget {
            container_id: container_id.to_string(),
            host_port: Some(host_port),
            path: self.config.probe_path.clone(),
        };
        let deadline = Instant::now() + self.config.health_grace;

        loop {
            if self.engine.probe(&target, self.config.probe_timeout).await
                == HealthState::Healthy
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DeployError::HealthCheckTimeout(self.config.health_grace));
            }
            tokio::time::sleep(self.config.probe_interval).await;
        }
    }

    /// Record the terminal state, tear down a failed attempt's resources,
    /// and bump the metrics. The deploy lock is still held by the caller.
    async fn finish(
        &self,
        app_name: &str,
        mut deployment: Deployment,
        driven: Result<(), DeployError>,
        cleanup: &Mutex<Cleanup>,
    ) -> Result<Deployment, DeployError> {
        match driven {
            Ok(()) => {
                self.history.put(&deployment)?;
                let _ = self.history.prune(app_name, self.config.history_retention);
                self.metrics.deployment_succeeded();
                Ok(deployment)
            }
            Err(e) => {
                let leftovers = std::mem::take(
                    &mut *cleanup.lock().unwrap_or_else(|e| e.into_inner()),
                );
                if let Some(container_id) = &leftovers.container_id {
                    self.retire_container(container_id).await;
                }
                if let Some(port) = leftovers.host_port {
                    self.ports.release(port);
                }

                if !deployment.status.is_terminal() {
                    deployment.fail(&e.to_string())?;
                }
                self.history.put(&deployment)?;
                self.metrics.deployment_failed(e.reason());
                warn!(
                    app = %app_name,
                    deployment = deployment.id,
                    reason = e.reason(),
                    error = %e,
                    "deployment failed"
                );
                Err(e)
            }
        }
    }

    /// Stop and remove a container, logging instead of failing: retiring
    /// leftovers must never take down a deploy that already succeeded.
    async fn retire_container(&self, container_id: &str) {
        if let Err(e) = self.engine.stop(container_id, self.config.stop_grace).await {
            warn!(container = %container_id, error = %e, "stop failed while retiring");
        }
        if let Err(e) = self.engine.remove(container_id).await {
            warn!(container = %container_id, error = %e, "remove failed while retiring");
        }
    }

    async fn resolve_env(&self, keys: &[String]) -> Result<Vec<(String, String)>, DeployError> {
        let mut env = Vec::with_capacity(keys.len());
        for key in keys {
            let value = self.secrets.get(key).await?;
            env.push((key.clone(), value.expose_secret().to_string()));
        }
        Ok(env)
    }
}

#[async_trait::async_trait]
impl RecreateDeployment for Orchestrator {
    async fn recreate(&self, app_name: &str) -> Result<Deployment, DeployError> {
        Orchestrator::recreate(self, app_name).await
    }
}

/// Image tag derived from the commit: rebuilding unchanged source reuses
/// the same tag (and the layer cache yields the same digest).
fn image_tag(app_name: &str, commit_sha: &str) -> String {
    let short = &commit_sha[..commit_sha.len().min(12)];
    format!("{app_name}:{short}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use drydock_engine::{EngineError, EngineResult};
    use drydock_proxy::{ProxyError, ProxyResult, SyncOutcome};
    use drydock_secrets::{SecretsError, SecretsResult};
    use drydock_source::{Checkout, SourceError, SourceResult};
    use drydock_state::{ManagedContainer, RuntimeStatus};
    use secrecy::SecretString;

    // ── Scripted fakes ─────────────────────────────────────────────

    #[derive(Clone)]
    struct FakeContainer {
        app_name: String,
        deployment_id: u64,
        image_tag: String,
        host_port: u16,
        running: bool,
    }

    #[derive(Default)]
    struct FakeEngine {
        containers: Mutex<HashMap<String, FakeContainer>>,
        next_id: AtomicU64,
        built: Mutex<Vec<String>>,
        fail_build: AtomicBool,
        fail_run: AtomicBool,
        slow_build: AtomicBool,
        /// Scripted probe results; empty means always healthy.
        probe_script: Mutex<VecDeque<HealthState>>,
    }

    impl FakeEngine {
        fn script_probes(&self, results: &[HealthState]) {
            *self.probe_script.lock().unwrap() = results.iter().copied().collect();
        }

        fn running_for(&self, app: &str) -> Vec<FakeContainer> {
            self.containers
                .lock()
                .unwrap()
                .values()
                .filter(|c| c.app_name == app && c.running)
                .cloned()
                .collect()
        }

        fn build_count(&self) -> usize {
            self.built.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl ContainerEngine for FakeEngine {
        async fn build(&self, _context: &std::path::Path, tag: &str) -> EngineResult<String> {
            if self.slow_build.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.fail_build.load(Ordering::SeqCst) {
                return Err(EngineError::BuildFailed {
                    log: "step 3/5: command exited 1".to_string(),
                });
            }
            self.built.lock().unwrap().push(tag.to_string());
            Ok(tag.to_string())
        }

        async fn run(&self, spec: &RunSpec) -> EngineResult<String> {
            if self.fail_run.load(Ordering::SeqCst) {
                return Err(EngineError::StartFailed("port is already allocated".into()));
            }
            let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.containers.lock().unwrap().insert(
                id.clone(),
                FakeContainer {
                    app_name: spec.app_name.clone(),
                    deployment_id: spec.deployment_id,
                    image_tag: spec.image_tag.clone(),
                    host_port: spec.host_port,
                    running: true,
                },
            );
            Ok(id)
        }

        async fn stop(&self, container_id: &str, _grace: Duration) -> EngineResult<()> {
            if let Some(c) = self.containers.lock().unwrap().get_mut(container_id) {
                c.running = false;
            }
            Ok(())
        }

        async fn remove(&self, container_id: &str) -> EngineResult<()> {
            self.containers.lock().unwrap().remove(container_id);
            Ok(())
        }

        async fn restart(&self, container_id: &str, _grace: Duration) -> EngineResult<()> {
            match self.containers.lock().unwrap().get_mut(container_id) {
                Some(c) => {
                    c.running = true;
                    Ok(())
                }
                None => Err(EngineError::NotFound(container_id.to_string())),
            }
        }

        async fn inspect(&self, container_id: &str) -> EngineResult<RuntimeStatus> {
            match self.containers.lock().unwrap().get(container_id) {
                Some(c) if c.running => Ok(RuntimeStatus::Running),
                Some(_) => Ok(RuntimeStatus::Exited),
                None => Err(EngineError::NotFound(container_id.to_string())),
            }
        }

        async fn list_by_label(&self, app_name: &str) -> EngineResult<Vec<ManagedContainer>> {
            Ok(self
                .containers
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, c)| c.app_name == app_name)
                .map(|(id, c)| ManagedContainer {
                    id: id.clone(),
                    app_name: c.app_name.clone(),
                    deployment_id: Some(c.deployment_id),
                    image_tag: c.image_tag.clone(),
                    host_port: Some(c.host_port),
                    runtime_status: if c.running {
                        RuntimeStatus::Running
                    } else {
                        RuntimeStatus::Exited
                    },
                })
                .collect())
        }

        async fn list_managed(&self) -> EngineResult<Vec<ManagedContainer>> {
            let apps: Vec<String> = self
                .containers
                .lock()
                .unwrap()
                .values()
                .map(|c| c.app_name.clone())
                .collect();
            let mut out = Vec::new();
            for app in apps {
                out.extend(self.list_by_label(&app).await?);
            }
            Ok(out)
        }

        async fn exposed_port(&self, _image_tag: &str) -> EngineResult<u16> {
            Ok(8080)
        }

        async fn probe(&self, _target: &ProbeTarget, _timeout: Duration) -> HealthState {
            self.probe_script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(HealthState::Healthy)
        }
    }

    #[derive(Default)]
    struct FakeProxy {
        routes: Mutex<HashMap<String, u16>>,
        fail_sync: AtomicBool,
    }

    impl FakeProxy {
        fn route(&self, app: &str) -> Option<u16> {
            self.routes.lock().unwrap().get(app).copied()
        }

        fn route_count(&self) -> usize {
            self.routes.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl ProxyRouter for FakeProxy {
        async fn sync(&self, app_name: &str, target_port: u16) -> ProxyResult<SyncOutcome> {
            if self.fail_sync.load(Ordering::SeqCst) {
                return Err(ProxyError::RouteSyncFailed {
                    app: app_name.to_string(),
                    detail: "reload exited 1".to_string(),
                });
            }
            self.routes
                .lock()
                .unwrap()
                .insert(app_name.to_string(), target_port);
            Ok(SyncOutcome::Updated)
        }

        async fn remove(&self, app_name: &str) -> ProxyResult<()> {
            self.routes.lock().unwrap().remove(app_name);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeSource {
        sha: Mutex<String>,
        fail: AtomicBool,
    }

    impl FakeSource {
        fn with_sha(sha: &str) -> Self {
            Self {
                sha: Mutex::new(sha.to_string()),
                fail: AtomicBool::new(false),
            }
        }

        fn set_sha(&self, sha: &str) {
            *self.sha.lock().unwrap() = sha.to_string();
        }
    }

    #[async_trait::async_trait]
    impl SourceFetcher for FakeSource {
        async fn sync(&self, app: &str, _url: &str, _branch: &str) -> SourceResult<Checkout> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SourceError::Unavailable {
                    app: app.to_string(),
                    detail: "could not resolve host".to_string(),
                });
            }
            Ok(Checkout {
                workdir: std::path::PathBuf::from("/tmp/checkout"),
                commit_sha: self.sha.lock().unwrap().clone(),
            })
        }

        async fn remove(&self, _app: &str) -> SourceResult<()> {
            Ok(())
        }
    }

    struct FakeSecrets {
        values: HashMap<String, String>,
    }

    impl FakeSecrets {
        fn empty() -> Self {
            Self {
                values: HashMap::new(),
            }
        }
    }

    #[async_trait::async_trait]
    impl SecretsProvider for FakeSecrets {
        async fn get(&self, key: &str) -> SecretsResult<SecretString> {
            self.values
                .get(key)
                .map(|v| SecretString::from(v.clone()))
                .ok_or_else(|| SecretsError::Unavailable(key.to_string()))
        }
    }

    // ── Harness ────────────────────────────────────────────────────

    struct Harness {
        orchestrator: Orchestrator,
        engine: Arc<FakeEngine>,
        proxy: Arc<FakeProxy>,
        source: Arc<FakeSource>,
        metrics: Arc<Metrics>,
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            deploy_timeout: Duration::from_secs(5),
            health_grace: Duration::from_millis(100),
            probe_interval: Duration::from_millis(10),
            probe_timeout: Duration::from_millis(50),
            history_retention: 10,
            ..OrchestratorConfig::default()
        }
    }

    fn harness(port_start: u16) -> Harness {
        harness_with(port_start, fast_config())
    }

    fn harness_with(port_start: u16, config: OrchestratorConfig) -> Harness {
        let engine = Arc::new(FakeEngine::default());
        let proxy = Arc::new(FakeProxy::default());
        let source = Arc::new(FakeSource::with_sha("abc123def4567890"));
        let metrics = Arc::new(Metrics::new());

        let orchestrator = Orchestrator::new(
            Arc::new(AppRegistry::new()),
            HistoryStore::open_in_memory().unwrap(),
            source.clone(),
            engine.clone(),
            proxy.clone(),
            Arc::new(FakeSecrets::empty()),
            Arc::new(PortAllocator::new(port_start, port_start + 50)),
            metrics.clone(),
            config,
        );

        Harness {
            orchestrator,
            engine,
            proxy,
            source,
            metrics,
        }
    }

    fn request(app: &str) -> DeployRequest {
        DeployRequest {
            app_name: app.to_string(),
            repo_url: "https://example.com/demo.git".to_string(),
            branch: "main".to_string(),
            env_keys: vec![],
        }
    }

    // ── Tests ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn first_deploy_completes_and_routes() {
        let h = harness(43000);

        let deployment = h.orchestrator.deploy(request("shop")).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Complete);
        assert_eq!(deployment.image_tag, "shop:abc123def456");
        assert!(deployment.container_id.is_some());

        // Routed to the container's port, exactly one route.
        let running = h.engine.running_for("shop");
        assert_eq!(running.len(), 1);
        assert_eq!(h.proxy.route("shop"), Some(running[0].host_port));
        assert_eq!(h.proxy.route_count(), 1);

        let app = h
            .orchestrator
            .registry()
            .get("shop")
            .await
            .unwrap()
            .snapshot()
            .await;
        assert_eq!(app.current_deployment.as_ref().unwrap().id, deployment.id);
        assert_eq!(app.health, HealthState::Healthy);
        assert_eq!(h.metrics.succeeded_count(), 1);
    }

    #[tokio::test]
    async fn second_deploy_swaps_with_zero_downtime_ordering() {
        let h = harness(43060);

        let first = h.orchestrator.deploy(request("shop")).await.unwrap();
        let old_port = h.proxy.route("shop").unwrap();

        h.source.set_sha("fedcba987654321");
        let second = h.orchestrator.deploy(request("shop")).await.unwrap();

        // New deployment routed, old container retired, old port released.
        assert_ne!(second.id, first.id);
        let running = h.engine.running_for("shop");
        assert_eq!(running.len(), 1, "exactly one routed container");
        assert_eq!(running[0].deployment_id, second.id);
        let new_port = h.proxy.route("shop").unwrap();
        assert_ne!(new_port, old_port);
        assert_eq!(h.proxy.route_count(), 1);
    }

    #[tokio::test]
    async fn build_failure_leaves_old_deployment_serving() {
        let h = harness(43120);

        let first = h.orchestrator.deploy(request("shop")).await.unwrap();
        let routed_port = h.proxy.route("shop").unwrap();

        h.engine.fail_build.store(true, Ordering::SeqCst);
        h.source.set_sha("fedcba987654321");
        let err = h.orchestrator.deploy(request("shop")).await.unwrap_err();
        assert!(matches!(err, DeployError::BuildFailed { .. }));

        // Previously routed port unchanged, old container still running.
        assert_eq!(h.proxy.route("shop"), Some(routed_port));
        let app = h
            .orchestrator
            .registry()
            .get("shop")
            .await
            .unwrap()
            .snapshot()
            .await;
        assert_eq!(app.current_deployment.as_ref().unwrap().id, first.id);
        assert_eq!(h.engine.running_for("shop").len(), 1);
        assert_eq!(h.metrics.failed_count("build_failed"), 1);

        // The failed record is retained for audit.
        let history = h.orchestrator.history().list_for_app("shop").unwrap();
        assert_eq!(history[0].status, DeploymentStatus::Failed);
        assert!(history[0].error.as_deref().unwrap().contains("build failed"));
    }

    #[tokio::test]
    async fn start_failure_cleans_up_and_preserves_old() {
        let h = harness(43180);

        h.orchestrator.deploy(request("shop")).await.unwrap();
        let routed_port = h.proxy.route("shop").unwrap();

        h.engine.fail_run.store(true, Ordering::SeqCst);
        h.source.set_sha("fedcba987654321");
        let err = h.orchestrator.deploy(request("shop")).await.unwrap_err();
        assert!(matches!(err, DeployError::StartFailed(_)));

        assert_eq!(h.proxy.route("shop"), Some(routed_port));
        assert_eq!(h.engine.running_for("shop").len(), 1);
        assert_eq!(h.metrics.failed_count("start_failed"), 1);
    }

    #[tokio::test]
    async fn health_gate_timeout_retires_new_container() {
        let h = harness(43240);

        h.orchestrator.deploy(request("shop")).await.unwrap();
        let routed_port = h.proxy.route("shop").unwrap();
        let old_container = h.engine.running_for("shop")[0].clone();

        // Script the new container to never reach healthy.
        h.engine.script_probes(&[HealthState::Unhealthy; 32]);
        h.source.set_sha("fedcba987654321");
        let err = h.orchestrator.deploy(request("shop")).await.unwrap_err();
        assert!(matches!(err, DeployError::HealthCheckTimeout(_)));

        // Old container untouched; the failed one is gone.
        let running = h.engine.running_for("shop");
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].deployment_id, old_container.deployment_id);
        assert_eq!(h.proxy.route("shop"), Some(routed_port));
    }

    #[tokio::test]
    async fn route_sync_failure_keeps_old_route_active() {
        let h = harness(43300);

        h.orchestrator.deploy(request("shop")).await.unwrap();
        let routed_port = h.proxy.route("shop").unwrap();

        h.proxy.fail_sync.store(true, Ordering::SeqCst);
        h.source.set_sha("fedcba987654321");
        let err = h.orchestrator.deploy(request("shop")).await.unwrap_err();
        assert!(matches!(err, DeployError::RouteSyncFailed(_)));

        assert_eq!(h.proxy.route("shop"), Some(routed_port));
        assert_eq!(h.engine.running_for("shop").len(), 1);
        assert_eq!(h.metrics.failed_count("route_sync_failed"), 1);
    }

    #[tokio::test]
    async fn concurrent_deploys_reject_the_loser_immediately() {
        let h = harness(43360);

        // Register the app, then hold its deploy lock as an in-flight
        // deploy would.
        let entry = h
            .orchestrator
            .registry()
            .ensure(
                "shop",
                AppSource {
                    repo_url: "https://example.com/demo.git".to_string(),
                    branch: "main".to_string(),
                },
            )
            .await
            .unwrap();
        let _guard = entry.try_deploy_lock().unwrap();

        let started = std::time::Instant::now();
        let err = h.orchestrator.deploy(request("shop")).await.unwrap_err();
        assert!(matches!(err, DeployError::DeploymentInProgress(_)));
        // Fail-fast, not queued behind the in-flight deploy.
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn missing_secret_fails_before_any_container_starts() {
        let h = harness(43420);

        let mut req = request("shop");
        req.env_keys = vec!["DATABASE_URL".to_string()];
        let err = h.orchestrator.deploy(req).await.unwrap_err();
        assert!(matches!(err, DeployError::SecretUnavailable(_)));

        assert!(h.engine.running_for("shop").is_empty());
        assert!(h.proxy.route("shop").is_none());
        assert_eq!(h.metrics.failed_count("secret_unavailable"), 1);
    }

    #[tokio::test]
    async fn recreate_reuses_image_with_new_container_and_port() {
        let h = harness(43480);

        let first = h.orchestrator.deploy(request("shop")).await.unwrap();
        let old_port = h.proxy.route("shop").unwrap();
        let builds_before = h.engine.build_count();

        let recreated = h.orchestrator.recreate("shop").await.unwrap();

        // New record, identical image, no new build or clone.
        assert_ne!(recreated.id, first.id);
        assert_eq!(recreated.image_tag, first.image_tag);
        assert_eq!(recreated.commit_sha, first.commit_sha);
        assert_eq!(h.engine.build_count(), builds_before);

        // Different container and port, still exactly one of each.
        let running = h.engine.running_for("shop");
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].deployment_id, recreated.id);
        assert_ne!(h.proxy.route("shop").unwrap(), old_port);
    }

    #[tokio::test]
    async fn recreate_without_known_good_fails() {
        let h = harness(43540);

        // Register the app via a failed deploy (source down).
        h.source.fail.store(true, Ordering::SeqCst);
        let _ = h.orchestrator.deploy(request("shop")).await.unwrap_err();

        let err = h.orchestrator.recreate("shop").await.unwrap_err();
        assert!(matches!(err, DeployError::Internal(_)));

        let err = h.orchestrator.recreate("ghost").await.unwrap_err();
        assert!(matches!(err, DeployError::AppNotFound(_)));
    }

    #[tokio::test]
    async fn source_failure_marks_deployment_failed() {
        let h = harness(43600);
        h.source.fail.store(true, Ordering::SeqCst);

        let err = h.orchestrator.deploy(request("shop")).await.unwrap_err();
        assert!(matches!(err, DeployError::SourceUnavailable(_)));

        let history = h.orchestrator.history().list_for_app("shop").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, DeploymentStatus::Failed);
        assert_eq!(h.metrics.failed_count("source_unavailable"), 1);
    }

    #[tokio::test]
    async fn deploy_deadline_aborts_and_releases_the_lock() {
        let mut config = fast_config();
        config.deploy_timeout = Duration::from_millis(100);
        let h = harness_with(43660, config);

        h.engine.slow_build.store(true, Ordering::SeqCst);
        let err = h.orchestrator.deploy(request("shop")).await.unwrap_err();
        assert!(matches!(err, DeployError::Aborted(_)));
        assert!(h.engine.running_for("shop").is_empty());

        // Lock released: the next deploy proceeds.
        h.engine.slow_build.store(false, Ordering::SeqCst);
        let deployment = h.orchestrator.deploy(request("shop")).await.unwrap();
        assert_eq!(deployment.status, DeploymentStatus::Complete);
    }

    #[tokio::test]
    async fn remove_app_tears_everything_down() {
        let h = harness(43720);

        h.orchestrator.deploy(request("shop")).await.unwrap();
        h.orchestrator.remove_app("shop").await.unwrap();

        assert!(h.engine.running_for("shop").is_empty());
        assert!(h.proxy.route("shop").is_none());
        assert!(h.orchestrator.registry().get("shop").await.is_none());
        assert!(h.orchestrator.history().list_for_app("shop").unwrap().is_empty());
    }

    #[tokio::test]
    async fn recover_rebuilds_registry_from_store() {
        let h = harness(43780);
        h.orchestrator.deploy(request("shop")).await.unwrap();
        let routed_port = h.proxy.route("shop").unwrap();

        // Second orchestrator over the same store: a process restart.
        let restarted = Orchestrator::new(
            Arc::new(AppRegistry::new()),
            h.orchestrator.history().clone(),
            h.source.clone(),
            h.engine.clone(),
            h.proxy.clone(),
            Arc::new(FakeSecrets::empty()),
            Arc::new(PortAllocator::new(43780, 43830)),
            Arc::new(Metrics::new()),
            fast_config(),
        );

        let recovered = restarted.recover().await.unwrap();
        assert_eq!(recovered, 1);

        let app = restarted.registry().get("shop").await.unwrap().snapshot().await;
        assert_eq!(app.host_port, Some(routed_port));
        assert!(app.current_deployment.is_some());

        // Recovery is idempotent.
        assert_eq!(restarted.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn distinct_apps_deploy_concurrently() {
        let h = Arc::new(harness(43840));

        let a = {
            let h = h.clone();
            tokio::spawn(async move { h.orchestrator.deploy(request("app-a")).await })
        };
        let b = {
            let h = h.clone();
            tokio::spawn(async move { h.orchestrator.deploy(request("app-b")).await })
        };

        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a.status, DeploymentStatus::Complete);
        assert_eq!(b.status, DeploymentStatus::Complete);
        assert_eq!(h.proxy.route_count(), 2);
        // Distinct host ports.
        assert_ne!(h.proxy.route("app-a"), h.proxy.route("app-b"));
    }

    #[tokio::test]
    async fn invalid_app_name_is_rejected_up_front() {
        let h = harness(43900);
        let err = h.orchestrator.deploy(request("../etc")).await.unwrap_err();
        assert!(matches!(err, DeployError::InvalidAppName(_)));
    }

    #[test]
    fn image_tag_truncates_sha() {
        assert_eq!(image_tag("shop", "abc123def4567890"), "shop:abc123def456");
        assert_eq!(image_tag("shop", "abc"), "shop:abc");
    }
}
