//! drydock-metrics — process-wide counters and Prometheus rendering.
//!
//! Counters are bumped as side effects of state transitions and never
//! gate them: a metrics problem can't fail a deploy. Rendering emits the
//! Prometheus text exposition format for scraping.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide metrics registry.
#[derive(Default)]
pub struct Metrics {
    deployments_succeeded: AtomicU64,
    /// Failed deployments keyed by failure reason (the error taxonomy).
    deployments_failed: Mutex<BTreeMap<&'static str, u64>>,
    healer_restarts: AtomicU64,
    healer_recreates: AtomicU64,
    active_apps: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deployment_succeeded(&self) {
        self.deployments_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn deployment_failed(&self, reason: &'static str) {
        let mut failed = self
            .deployments_failed
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *failed.entry(reason).or_insert(0) += 1;
    }

    pub fn healer_restart(&self) {
        self.healer_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn healer_recreate(&self) {
        self.healer_recreates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_apps(&self, count: u64) {
        self.active_apps.store(count, Ordering::Relaxed);
    }

    pub fn succeeded_count(&self) -> u64 {
        self.deployments_succeeded.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self, reason: &'static str) -> u64 {
        self.deployments_failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(reason)
            .copied()
            .unwrap_or(0)
    }

    pub fn restart_count(&self) -> u64 {
        self.healer_restarts.load(Ordering::Relaxed)
    }

    pub fn recreate_count(&self) -> u64 {
        self.healer_recreates.load(Ordering::Relaxed)
    }

    /// Render everything in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP drydock_deployments_succeeded_total Deployments that reached COMPLETE.\n");
        out.push_str("# TYPE drydock_deployments_succeeded_total counter\n");
        out.push_str(&format!(
            "drydock_deployments_succeeded_total {}\n",
            self.succeeded_count()
        ));

        out.push_str("# HELP drydock_deployments_failed_total Failed deployments by reason.\n");
        out.push_str("# TYPE drydock_deployments_failed_total counter\n");
        {
            let failed = self
                .deployments_failed
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for (reason, count) in failed.iter() {
                out.push_str(&format!(
                    "drydock_deployments_failed_total{{reason=\"{reason}\"}} {count}\n"
                ));
            }
        }

        out.push_str("# HELP drydock_healer_restarts_total Containers restarted by the healer.\n");
        out.push_str("# TYPE drydock_healer_restarts_total counter\n");
        out.push_str(&format!(
            "drydock_healer_restarts_total {}\n",
            self.restart_count()
        ));

        out.push_str("# HELP drydock_healer_recreates_total Deployments recreated by the healer.\n");
        out.push_str("# TYPE drydock_healer_recreates_total counter\n");
        out.push_str(&format!(
            "drydock_healer_recreates_total {}\n",
            self.recreate_count()
        ));

        out.push_str("# HELP drydock_active_apps Apps with desired state running.\n");
        out.push_str("# TYPE drydock_active_apps gauge\n");
        out.push_str(&format!(
            "drydock_active_apps {}\n",
            self.active_apps.load(Ordering::Relaxed)
        ));

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.deployment_succeeded();
        metrics.deployment_succeeded();
        metrics.deployment_failed("build_failed");
        metrics.healer_restart();
        metrics.healer_recreate();
        metrics.set_active_apps(3);

        assert_eq!(metrics.succeeded_count(), 2);
        assert_eq!(metrics.failed_count("build_failed"), 1);
        assert_eq!(metrics.failed_count("start_failed"), 0);
        assert_eq!(metrics.restart_count(), 1);
        assert_eq!(metrics.recreate_count(), 1);
    }

    #[test]
    fn render_empty() {
        let metrics = Metrics::new();
        let output = metrics.render_prometheus();
        // Type declarations are present even with no data.
        assert!(output.contains("# TYPE drydock_deployments_succeeded_total counter"));
        assert!(output.contains("drydock_active_apps 0"));
    }

    #[test]
    fn render_labels_failure_reasons() {
        let metrics = Metrics::new();
        metrics.deployment_failed("source_unavailable");
        metrics.deployment_failed("source_unavailable");
        metrics.deployment_failed("route_sync_failed");

        let output = metrics.render_prometheus();
        assert!(output.contains(
            "drydock_deployments_failed_total{reason=\"source_unavailable\"} 2"
        ));
        assert!(output.contains(
            "drydock_deployments_failed_total{reason=\"route_sync_failed\"} 1"
        ));
    }

    #[test]
    fn render_format_is_prometheus_compatible() {
        let metrics = Metrics::new();
        metrics.deployment_succeeded();
        metrics.deployment_failed("build_failed");

        for line in metrics.render_prometheus().lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            // Every sample line ends in a numeric value.
            let value = line.rsplit(' ').next().unwrap();
            assert!(value.parse::<f64>().is_ok(), "bad sample line: {line}");
        }
    }
}
