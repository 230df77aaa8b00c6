//! HistoryStore — redb-backed persistence for apps and deployment history.
//!
//! App records and deployment records are JSON-serialized into
//! `&str -> &[u8]` tables. Deployments are keyed `{app}:{id:08}` so a
//! prefix scan per app returns records in id order; ids are allocated
//! monotonically per app from a counters table. Supports on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::types::{App, Deployment, DeploymentStatus, deployment_key};

/// App records keyed by app name.
const APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("apps");

/// Deployment records keyed by `{app}:{id:08}`.
const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Per-app deployment id counters keyed by app name.
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe persistent store backed by redb.
#[derive(Clone)]
pub struct HistoryStore {
    db: Arc<Database>,
}

impl HistoryStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "history store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory history store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(APPS).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(COUNTERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Apps ───────────────────────────────────────────────────────

    /// Insert or update an app record (shutdown/restart durability).
    pub fn put_app(&self, app: &App) -> StateResult<()> {
        let value = serde_json::to_vec(app).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(APPS).map_err(map_err!(Table))?;
            table
                .insert(app.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get an app record by name.
    pub fn get_app(&self, name: &str) -> StateResult<Option<App>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let app: App =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(app))
            }
            None => Ok(None),
        }
    }

    /// All persisted app records.
    pub fn list_apps(&self) -> StateResult<Vec<App>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let app: App =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(app);
        }
        Ok(results)
    }

    /// Delete an app record. Returns true if it existed.
    pub fn delete_app(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(APPS).map_err(map_err!(Table))?;
            existed = table.remove(name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Allocate the next deployment id for an app. Starts at 1.
    pub fn next_id(&self, app_name: &str) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id;
        {
            let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            let current = table
                .get(app_name)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value())
                .unwrap_or(0);
            id = current + 1;
            table.insert(app_name, id).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(id)
    }

    /// Insert or update a deployment record.
    pub fn put(&self, deployment: &Deployment) -> StateResult<()> {
        let key = deployment.table_key();
        let value = serde_json::to_vec(deployment).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a deployment by app name and id.
    pub fn get(&self, app_name: &str, id: u64) -> StateResult<Option<Deployment>> {
        let key = deployment_key(app_name, id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let deployment: Deployment =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(deployment))
            }
            None => Ok(None),
        }
    }

    /// All deployments for an app, most recent first.
    pub fn list_for_app(&self, app_name: &str) -> StateResult<Vec<Deployment>> {
        let prefix = format!("{app_name}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let deployment: Deployment =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(deployment);
            }
        }
        results.reverse();
        Ok(results)
    }

    /// The most recent deployment that reached `Complete` (last known-good).
    pub fn latest_complete(&self, app_name: &str) -> StateResult<Option<Deployment>> {
        Ok(self
            .list_for_app(app_name)?
            .into_iter()
            .find(|d| d.status == DeploymentStatus::Complete))
    }

    /// Drop superseded records, keeping the newest `keep` per app.
    ///
    /// Returns the number of records deleted.
    pub fn prune(&self, app_name: &str, keep: usize) -> StateResult<u32> {
        let all = self.list_for_app(app_name)?;
        if all.len() <= keep {
            return Ok(0);
        }
        let stale: Vec<String> = all[keep..].iter().map(|d| d.table_key()).collect();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = stale.len() as u32;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            for key in &stale {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app = %app_name, pruned = count, "history pruned");
        Ok(count)
    }

    /// Delete every deployment record and the id counter for an app.
    pub fn delete_for_app(&self, app_name: &str) -> StateResult<u32> {
        let deleted = self.prune(app_name, 0)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(COUNTERS).map_err(map_err!(Table))?;
            table.remove(app_name).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AppSource;

    fn store() -> HistoryStore {
        HistoryStore::open_in_memory().unwrap()
    }

    fn record(store: &HistoryStore, app: &str, status: DeploymentStatus) -> Deployment {
        let id = store.next_id(app).unwrap();
        let mut d = Deployment::queued(id, app, "abc123def456", &format!("{app}:abc123def456"));
        if status != DeploymentStatus::Queued {
            d.advance(status).unwrap();
        }
        store.put(&d).unwrap();
        d
    }

    fn test_app(name: &str) -> App {
        App::new(
            name,
            AppSource {
                repo_url: "https://example.com/demo.git".to_string(),
                branch: "main".to_string(),
            },
        )
    }

    #[test]
    fn ids_are_monotonic_per_app() {
        let store = store();
        assert_eq!(store.next_id("demo").unwrap(), 1);
        assert_eq!(store.next_id("demo").unwrap(), 2);
        assert_eq!(store.next_id("other").unwrap(), 1);
        assert_eq!(store.next_id("demo").unwrap(), 3);
    }

    #[test]
    fn put_and_get() {
        let store = store();
        let d = record(&store, "demo", DeploymentStatus::Complete);

        let back = store.get("demo", d.id).unwrap();
        assert_eq!(back, Some(d));
        assert!(store.get("demo", 99).unwrap().is_none());
    }

    #[test]
    fn list_is_most_recent_first() {
        let store = store();
        record(&store, "demo", DeploymentStatus::Complete);
        record(&store, "demo", DeploymentStatus::Failed);
        let latest = record(&store, "demo", DeploymentStatus::Complete);
        record(&store, "other", DeploymentStatus::Complete);

        let all = store.list_for_app("demo").unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, latest.id);
        assert!(all[0].id > all[1].id && all[1].id > all[2].id);
    }

    #[test]
    fn latest_complete_skips_failures() {
        let store = store();
        let good = record(&store, "demo", DeploymentStatus::Complete);
        record(&store, "demo", DeploymentStatus::Failed);

        let found = store.latest_complete("demo").unwrap().unwrap();
        assert_eq!(found.id, good.id);
    }

    #[test]
    fn latest_complete_none_before_first_success() {
        let store = store();
        record(&store, "demo", DeploymentStatus::Failed);
        assert!(store.latest_complete("demo").unwrap().is_none());
    }

    #[test]
    fn prune_keeps_newest() {
        let store = store();
        for _ in 0..5 {
            record(&store, "demo", DeploymentStatus::Complete);
        }

        let deleted = store.prune("demo", 2).unwrap();
        assert_eq!(deleted, 3);

        let remaining = store.list_for_app("demo").unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].id, 5);
        assert_eq!(remaining[1].id, 4);

        // Under the retention limit: nothing to prune.
        assert_eq!(store.prune("demo", 2).unwrap(), 0);
    }

    #[test]
    fn delete_for_app_resets_counter() {
        let store = store();
        record(&store, "demo", DeploymentStatus::Complete);
        record(&store, "demo", DeploymentStatus::Complete);

        let deleted = store.delete_for_app("demo").unwrap();
        assert_eq!(deleted, 2);
        assert!(store.list_for_app("demo").unwrap().is_empty());
        assert_eq!(store.next_id("demo").unwrap(), 1);
    }

    #[test]
    fn app_records_round_trip() {
        let store = store();
        let mut app = test_app("demo");
        app.host_port = Some(8001);

        store.put_app(&app).unwrap();
        assert_eq!(store.get_app("demo").unwrap(), Some(app.clone()));

        app.consecutive_failures = 2;
        store.put_app(&app).unwrap();
        assert_eq!(
            store.get_app("demo").unwrap().unwrap().consecutive_failures,
            2
        );

        assert_eq!(store.list_apps().unwrap().len(), 1);
        assert!(store.delete_app("demo").unwrap());
        assert!(!store.delete_app("demo").unwrap());
        assert!(store.get_app("demo").unwrap().is_none());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("drydock.redb");

        {
            let store = HistoryStore::open(&db_path).unwrap();
            store.put_app(&test_app("demo")).unwrap();
            record(&store, "demo", DeploymentStatus::Complete);
        }

        let store = HistoryStore::open(&db_path).unwrap();
        assert_eq!(store.list_apps().unwrap().len(), 1);
        assert_eq!(store.list_for_app("demo").unwrap().len(), 1);
        assert_eq!(store.next_id("demo").unwrap(), 2);
    }
}
