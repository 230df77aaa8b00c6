//! drydock-healer — the self-healing reconciliation daemon.
//!
//! On a fixed interval the healer audits every app whose desired state is
//! running: it resolves the routed container by label, probes it, and
//! repairs drift through an escalation ladder:
//!
//! ```text
//! probe unhealthy
//!   → tolerate          (below the consecutive-failure threshold)
//!   → restart           (same container, exponential backoff between tries)
//!   → recreate          (orchestrator re-runs start→route from the
//!                        last known-good image, zero-downtime)
//!   → halt              (recreate failed: marked unhealthy, left for
//!                        the operator, no restart storm)
//! ```
//!
//! Coordination with deploys is the per-app deploy lock: if a deploy is
//! in flight the healer skips the app this cycle — the deploy already
//! supersedes anything the healer would do. Audits fan out with bounded
//! parallelism and bounded probe timeouts, so one stuck app never delays
//! the cycle for the rest.

pub mod healer;

pub use healer::{AuditOutcome, Healer, HealerConfig};
