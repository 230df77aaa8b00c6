//! drydock-orchestrator — turns a deploy request into a routed container.
//!
//! The orchestrator drives one deployment at a time per app through
//!
//! ```text
//! QUEUED → CLONING → BUILDING → STARTING → ROUTING → COMPLETE
//!             │          │          │          │
//!             └──────────┴──────────┴──────────┴──→ FAILED
//! ```
//!
//! with the zero-downtime ordering: the new container is started on a
//! freshly allocated port and health-verified while the old one keeps
//! serving; only after the proxy retargets is the old container retired.
//! Every failure path tears down what the attempt created and leaves the
//! previously routed deployment untouched.
//!
//! Concurrency: one in-flight deployment per app, enforced by the
//! registry's per-app deploy lock. A second request for the same app is
//! rejected immediately with `DeploymentInProgress`; deploys for
//! different apps run concurrently. An overall deadline bounds every
//! deploy, and a timed-out attempt cleans up its partial container and
//! port before reporting failure.

pub mod error;
pub mod orchestrator;

pub use error::DeployError;
pub use orchestrator::{DeployRequest, Orchestrator, OrchestratorConfig, RecreateDeployment};
