//! drydock-engine — container lifecycle over the docker CLI.
//!
//! The engine wraps the low-level container operations the orchestrator
//! and healer need: build, run, stop, remove, restart, inspect,
//! list-by-label, declared-port detection, and bounded health probes.
//!
//! # Components
//!
//! - **`engine`** — the `ContainerEngine` trait and the `DockerEngine`
//!   implementation shelling out to the docker CLI
//! - **`probe`** — HTTP and TCP probe primitives with bounded timeouts
//! - **`ports`** — the host-port allocator, re-verified against the OS
//!   listener table at reservation time
//!
//! Containers carry `drydock.*` labels so their identity (app name,
//! deployment id) can be recovered after a restart of the coordinating
//! process.

pub mod engine;
pub mod ports;
pub mod probe;

pub use engine::{
    ContainerEngine, DockerEngine, EngineError, EngineResult, LABEL_APP, LABEL_DEPLOYMENT,
    LABEL_MANAGED, ProbeTarget, RunSpec,
};
pub use ports::{PortAllocator, PortError};
