//! The reconciliation loop and per-app escalation ladder.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use drydock_engine::{ContainerEngine, ProbeTarget};
use drydock_metrics::Metrics;
use drydock_orchestrator::{DeployError, RecreateDeployment};
use drydock_state::{
    AppEntry, AppRegistry, DesiredState, HealthState, ManagedContainer, epoch_secs,
};

/// Operator-tunable healer knobs.
#[derive(Debug, Clone)]
pub struct HealerConfig {
    /// Time between reconciliation cycles.
    pub interval: Duration,
    /// Timeout for a single probe.
    pub probe_timeout: Duration,
    /// HTTP path probed on each app.
    pub probe_path: String,
    /// Consecutive failed probes tolerated before acting.
    pub failure_threshold: u32,
    /// Base delay between restart attempts, doubled per attempt.
    pub restart_backoff_base: Duration,
    /// Cap for the restart backoff.
    pub restart_backoff_max: Duration,
    /// Restarts within the rolling window before escalating to recreate.
    pub restart_ceiling: u32,
    /// Rolling window for the restart ceiling.
    pub restart_window: Duration,
    /// Apps audited concurrently per cycle.
    pub max_parallel_checks: usize,
    /// Grace period for container restarts.
    pub stop_grace: Duration,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(2),
            probe_path: "/".to_string(),
            failure_threshold: 3,
            restart_backoff_base: Duration::from_secs(5),
            restart_backoff_max: Duration::from_secs(60),
            restart_ceiling: 3,
            restart_window: Duration::from_secs(600),
            max_parallel_checks: 4,
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// What one audit did for one app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    /// Not running by desire, or nothing deployed yet.
    Skipped,
    /// A deploy holds the app lock; the in-flight deploy supersedes us.
    DeployInFlight,
    /// Probe healthy; failure counters reset.
    Healthy,
    /// Probe inconclusive; no state change.
    Inconclusive,
    /// Unhealthy but below the failure threshold.
    Tolerated,
    /// Restart due but gated by backoff until the next cycle.
    BackoffWait,
    /// The container was restarted in place.
    Restarted,
    /// The orchestrator recreated the deployment.
    Recreated,
    /// Escalation exhausted; left for the operator.
    Halted,
}

/// Decision carried out of the lock scope (recreate re-acquires the lock
/// through the orchestrator, so it must run after the guard drops).
enum Verdict {
    Done(AuditOutcome),
    Recreate,
}

/// The self-healing daemon.
#[derive(Clone)]
pub struct Healer {
    registry: Arc<AppRegistry>,
    engine: Arc<dyn ContainerEngine>,
    recreate: Arc<dyn RecreateDeployment>,
    metrics: Arc<Metrics>,
    config: HealerConfig,
}

impl Healer {
    pub fn new(
        registry: Arc<AppRegistry>,
        engine: Arc<dyn ContainerEngine>,
        recreate: Arc<dyn RecreateDeployment>,
        metrics: Arc<Metrics>,
        config: HealerConfig,
    ) -> Self {
        Self {
            registry,
            engine,
            recreate,
            metrics,
            config,
        }
    }

    /// The daemon loop: one cycle per interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.config.interval, "healer daemon starting");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {
                    self.cycle().await;
                }
                _ = shutdown.changed() => {
                    info!("healer daemon shutting down");
                    break;
                }
            }
        }
    }

    /// Audit every app once, with bounded parallelism. A slow probe on
    /// one app never delays the others.
    pub async fn cycle(&self) -> Vec<(String, AuditOutcome)> {
        let entries = self.registry.list().await;
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_checks.max(1)));
        let mut audits = JoinSet::new();

        for entry in entries {
            let healer = self.clone();
            let semaphore = semaphore.clone();
            audits.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (entry.name().to_string(), AuditOutcome::Skipped);
                };
                let outcome = healer.audit_app(&entry).await;
                (entry.name().to_string(), outcome)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = audits.join_next().await {
            match joined {
                Ok(pair) => results.push(pair),
                Err(e) => error!(error = %e, "healer audit task panicked"),
            }
        }
        results
    }

    /// Audit one app and repair drift per the escalation ladder.
    pub async fn audit_app(&self, entry: &Arc<AppEntry>) -> AuditOutcome {
        let app = entry.snapshot().await;
        if app.desired_state != DesiredState::Running || app.current_deployment.is_none() {
            return AuditOutcome::Skipped;
        }
        if app.halted_at.is_some() {
            // A later successful deploy clears the halt; until then the
            // operator owns this app.
            return AuditOutcome::Halted;
        }

        let verdict = {
            let Some(_guard) = entry.try_deploy_lock() else {
                debug!(app = %app.name, "deploy in flight, skipping this cycle");
                return AuditOutcome::DeployInFlight;
            };

            let container = self.routed_container(&app.name, &app).await;
            let health = match &container {
                Some(c) => {
                    let target = ProbeTarget {
                        container_id: c.id.clone(),
                        host_port: c.host_port.or(app.host_port),
                        path: self.config.probe_path.clone(),
                    };
                    self.engine.probe(&target, self.config.probe_timeout).await
                }
                // Container vanished entirely: unhealthy by definition.
                None => HealthState::Unhealthy,
            };

            match health {
                HealthState::Healthy => {
                    entry
                        .update(|a| {
                            a.health = HealthState::Healthy;
                            a.consecutive_failures = 0;
                            a.restart_count = 0;
                            a.last_restart_at = None;
                        })
                        .await;
                    return AuditOutcome::Healthy;
                }
                HealthState::Unknown => return AuditOutcome::Inconclusive,
                HealthState::Unhealthy => {}
            }

            let failures = entry
                .update(|a| {
                    a.consecutive_failures += 1;
                    a.consecutive_failures
                })
                .await;
            if failures < self.config.failure_threshold {
                debug!(app = %app.name, failures, "unhealthy probe tolerated");
                return AuditOutcome::Tolerated;
            }

            entry.update(|a| a.health = HealthState::Unhealthy).await;
            warn!(app = %app.name, failures, "app unhealthy, escalating");

            self.escalate(entry, &app.name, container.as_ref()).await
            // Guard drops here; recreate re-acquires through the orchestrator.
        };

        match verdict {
            Verdict::Done(outcome) => outcome,
            Verdict::Recreate => self.run_recreate(entry).await,
        }
    }

    /// Restart-or-recreate decision for an unhealthy app. Runs under the
    /// app's deploy lock.
    async fn escalate(
        &self,
        entry: &Arc<AppEntry>,
        app_name: &str,
        container: Option<&ManagedContainer>,
    ) -> Verdict {
        let app = entry.snapshot().await;
        let now = epoch_secs();

        // Restarts outside the rolling window no longer count.
        let restarts_in_window = match app.last_restart_at {
            Some(last) if now.saturating_sub(last) <= self.config.restart_window.as_secs() => {
                app.restart_count
            }
            _ => 0,
        };

        // A vanished container can't be restarted; past the ceiling a
        // restart has already proven insufficient.
        let Some(container) = container else {
            info!(app = %app_name, "routed container vanished, recreating");
            return Verdict::Recreate;
        };
        if restarts_in_window >= self.config.restart_ceiling {
            info!(
                app = %app_name,
                restarts = restarts_in_window,
                "restart ceiling reached, recreating"
            );
            return Verdict::Recreate;
        }

        // Backoff gate between restart attempts.
        if let Some(last) = app.last_restart_at {
            let backoff = restart_backoff(
                self.config.restart_backoff_base,
                self.config.restart_backoff_max,
                restarts_in_window,
            );
            if now.saturating_sub(last) < backoff.as_secs() {
                debug!(app = %app_name, ?backoff, "restart gated by backoff");
                return Verdict::Done(AuditOutcome::BackoffWait);
            }
        }

        entry
            .update(|a| {
                a.restart_count = restarts_in_window + 1;
                a.last_restart_at = Some(now);
            })
            .await;

        match self.engine.restart(&container.id, self.config.stop_grace).await {
            Ok(()) => {
                self.metrics.healer_restart();
                info!(app = %app_name, container = %container.id, "container restarted");
                Verdict::Done(AuditOutcome::Restarted)
            }
            Err(e) => {
                // The restart attempt is spent; move up the ladder.
                warn!(app = %app_name, error = %e, "restart failed, recreating");
                Verdict::Recreate
            }
        }
    }

    /// Invoke the orchestrator's recreate path; on failure, halt the app
    /// instead of retrying forever.
    async fn run_recreate(&self, entry: &Arc<AppEntry>) -> AuditOutcome {
        let app_name = entry.name().to_string();
        match self.recreate.recreate(&app_name).await {
            Ok(deployment) => {
                self.metrics.healer_recreate();
                info!(app = %app_name, deployment = deployment.id, "app recreated");
                AuditOutcome::Recreated
            }
            Err(DeployError::DeploymentInProgress(_)) => AuditOutcome::DeployInFlight,
            Err(e) => {
                error!(
                    app = %app_name,
                    error = %e,
                    "recreate failed, halting app for operator intervention"
                );
                entry
                    .update(|a| {
                        a.health = HealthState::Unhealthy;
                        a.halted_at = Some(epoch_secs());
                    })
                    .await;
                AuditOutcome::Halted
            }
        }
    }

    /// The container the app's current deployment is routed to, if it
    /// still exists.
    async fn routed_container(
        &self,
        app_name: &str,
        app: &drydock_state::App,
    ) -> Option<ManagedContainer> {
        let containers = match self.engine.list_by_label(app_name).await {
            Ok(c) => c,
            Err(e) => {
                warn!(app = %app_name, error = %e, "container lookup failed");
                return None;
            }
        };
        let current_id = app
            .current_deployment
            .as_ref()
            .and_then(|d| d.container_id.as_deref())?;
        containers.into_iter().find(|c| c.id == current_id)
    }
}

/// Exponential restart backoff: base doubled per attempt, capped.
fn restart_backoff(base: Duration, max: Duration, attempts: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempts.min(16));
    base.saturating_mul(factor).min(max)
}
