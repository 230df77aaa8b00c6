//! drydock-state — domain types and shared state for Drydock.
//!
//! Three pieces live here:
//!
//! - **`types`** — the persisted/serialized domain model: `App`,
//!   `Deployment`, `ManagedContainer`, and their status enums
//! - **`registry`** — the in-process app registry: a keyed store of
//!   `AppEntry` values, each carrying its own state lock and the per-app
//!   deploy lock that gives deploys their single-flight semantics
//! - **`store`** — redb-backed persistence: app records (restart
//!   durability) and deployment history with monotonic per-app ids and
//!   retention-based garbage collection
//!
//! # Locking
//!
//! ```text
//! AppRegistry
//!   └── Arc<AppEntry> per app
//!       ├── RwLock<App>      (state reads/writes, short-held)
//!       └── Mutex<()>        (deploy lock: try_lock only, never queued)
//! ```
//!
//! Both the deployment orchestrator and the healer acquire the deploy lock
//! with `try_deploy_lock()`. A deploy that loses the race is rejected
//! immediately; a healer that loses it skips the app until its next cycle.

pub mod error;
pub mod registry;
pub mod store;
pub mod types;

pub use error::{StateError, StateResult};
pub use registry::{AppEntry, AppRegistry, DeployGuard};
pub use store::HistoryStore;
pub use types::*;
