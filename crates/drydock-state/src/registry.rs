//! App registry — the concurrency-safe keyed store shared by the
//! orchestrator and the healer.
//!
//! Each app gets one `AppEntry` holding its state behind a `RwLock` and a
//! dedicated deploy lock. The deploy lock is only ever acquired with
//! `try_lock`: a losing deploy is rejected immediately rather than queued,
//! and a losing healer skips the app until its next cycle.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::error::StateResult;
use crate::types::{App, AppSource, DesiredState, validate_app_name};

/// Held for the duration of a deploy (or a healer action) on one app.
///
/// Dropping the guard releases the app for the next actor.
pub struct DeployGuard {
    _guard: OwnedMutexGuard<()>,
}

/// One registered app: its state plus the per-app deploy lock.
pub struct AppEntry {
    name: String,
    state: RwLock<App>,
    deploy_lock: Arc<Mutex<()>>,
}

impl AppEntry {
    fn new(app: App) -> Self {
        Self {
            name: app.name.clone(),
            state: RwLock::new(app),
            deploy_lock: Arc::new(Mutex::new(())),
        }
    }

    /// The app's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Clone the current app state.
    pub async fn snapshot(&self) -> App {
        self.state.read().await.clone()
    }

    /// Mutate the app state under its lock, stamping `updated_at`.
    ///
    /// Returns whatever the closure returns, so callers can take values
    /// out of the old state (e.g. the deployment being replaced).
    pub async fn update<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut App) -> R,
    {
        let mut app = self.state.write().await;
        let out = f(&mut app);
        app.updated_at = crate::types::epoch_secs();
        out
    }

    /// Attempt the per-app deploy lock without blocking.
    ///
    /// `None` means another deploy (or healer action) is in flight.
    pub fn try_deploy_lock(&self) -> Option<DeployGuard> {
        self.deploy_lock
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| DeployGuard { _guard: guard })
    }
}

/// Keyed store of all registered apps.
#[derive(Default)]
pub struct AppRegistry {
    entries: RwLock<HashMap<String, Arc<AppEntry>>>,
}

impl AppRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an existing entry or register a new app for `source`.
    ///
    /// When the app already exists its source is updated in place, so a
    /// deploy request pointing at a new branch takes effect immediately.
    pub async fn ensure(&self, name: &str, source: AppSource) -> StateResult<Arc<AppEntry>> {
        validate_app_name(name)?;

        if let Some(entry) = self.get(name).await {
            entry
                .update(|app| {
                    if app.source != source {
                        app.source = source.clone();
                    }
                })
                .await;
            return Ok(entry);
        }

        let mut entries = self.entries.write().await;
        // Re-check under the write lock: another task may have won the race.
        if let Some(entry) = entries.get(name) {
            return Ok(entry.clone());
        }
        let entry = Arc::new(AppEntry::new(App::new(name, source)));
        entries.insert(name.to_string(), entry.clone());
        debug!(app = %name, "app registered");
        Ok(entry)
    }

    /// Insert a pre-built app record (process-restart recovery path).
    pub async fn insert(&self, app: App) -> Arc<AppEntry> {
        let mut entries = self.entries.write().await;
        let entry = Arc::new(AppEntry::new(app));
        entries.insert(entry.name.clone(), entry.clone());
        entry
    }

    /// Look up an app by name.
    pub async fn get(&self, name: &str) -> Option<Arc<AppEntry>> {
        let entries = self.entries.read().await;
        entries.get(name).cloned()
    }

    /// All entries, sorted by name for stable output.
    pub async fn list(&self) -> Vec<Arc<AppEntry>> {
        let entries = self.entries.read().await;
        let mut all: Vec<_> = entries.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Cloned state of every app, sorted by name.
    pub async fn snapshots(&self) -> Vec<App> {
        let mut out = Vec::new();
        for entry in self.list().await {
            out.push(entry.snapshot().await);
        }
        out
    }

    /// Remove an app, returning its entry so the caller can tear down
    /// the container and the proxy route.
    pub async fn remove(&self, name: &str) -> Option<Arc<AppEntry>> {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(name);
        if removed.is_some() {
            debug!(app = %name, "app removed from registry");
        }
        removed
    }

    /// Number of apps with `desired_state = Running`.
    pub async fn running_count(&self) -> u64 {
        let mut count = 0;
        for entry in self.list().await {
            if entry.snapshot().await.desired_state == DesiredState::Running {
                count += 1;
            }
        }
        count
    }
}
