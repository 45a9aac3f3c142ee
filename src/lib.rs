//! cStor Pool Manager - node-local control plane for pools and replicas
//!
//! Reconciles `CStorPool` and `CStorVolumeReplica` resources against the
//! node's pool engine (`zpool`/`zfs`).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Kubernetes API server                        │
//! └───────────────┬──────────────────────────────────┬───────────────┘
//!                 │ watch                            │ status writes
//! ┌───────────────┴───────────┐       ┌──────────────┴───────────────┐
//! │  Informers (Add / Modify  │──────▶│  Work queues (dedup, backoff) │
//! │  Destroy / Sync)          │       └──────────────┬───────────────┘
//! └───────────────────────────┘                      │
//!                                     ┌──────────────┴───────────────┐
//!                                     │  Pool / Replica reconcilers  │
//!                                     └──────────────┬───────────────┘
//!                                     ┌──────────────┴───────────────┐
//!                                     │  Pool engine gate (one       │
//!                                     │  command sequence at a time) │
//!                                     └──────────────┬───────────────┘
//!                                     ┌──────────────┴───────────────┐
//!                                     │  zpool / zfs                 │
//!                                     └──────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`]: runtime constants and operator configuration
//! - [`controller`]: informers, work queues, workers and the two reconcilers
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: core domain types and traits
//! - [`engine`]: pool engine command building, parsing and execution
//! - [`error`]: error types and handling
//! - [`startup`]: ordered startup and task supervision
//! - [`store`]: resource store adapters
//! - [`sync`]: engine gate and imported pool registry
//! - [`telemetry`]: metrics, health and readiness endpoints

pub mod config;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod engine;
pub mod error;
pub mod startup;
pub mod store;
pub mod sync;
pub mod telemetry;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{OperatorConfig, ReadOnlyRelease};

pub use controller::{
    run_informer, run_workers, PoolReconciler, Reconciler, ReplicaReconciler, ResourceFilter,
    WorkQueue,
};

pub use crd::{
    CStorPool, CStorPoolSpec, CStorPoolStatus, CStorVolumeReplica, CStorVolumeReplicaSpec,
    CStorVolumeReplicaStatus,
};

pub use domain::ports::{CommandRunner, CommandRunnerRef, ResourceStore, ResourceStoreRef};
pub use domain::types::{QueueOperation, QueuedWorkItem, ResourceKey};

pub use engine::{PoolEngine, RealRunner, ReplicaEngine};

pub use error::{Error, ErrorAction, Result};

pub use startup::{NamedTasks, Operator, Task};

pub use store::{KubeStore, MemoryStore};

pub use sync::{ImportedPoolRegistry, PoolEngineGate};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
