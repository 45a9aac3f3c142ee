//! Watch-driven reconcilers
//!
//! - [`queue`]: de-duplicating, rate-limited work queue
//! - [`informer`]: watcher events to work items
//! - [`worker`]: worker pool and error classification
//! - [`pool`]: `CStorPool` reconciler
//! - [`replica`]: `CStorVolumeReplica` reconciler

pub mod informer;
pub mod pool;
pub mod queue;
pub mod replica;
pub mod worker;

pub use informer::{run_informer, EventTracker, ResourceFilter};
pub use pool::{read_only_decision, PoolReconciler, ReadOnlyDecision, ReadOnlyInputs};
pub use queue::{QueueItem, WorkQueue};
pub use replica::ReplicaReconciler;
pub use worker::{process_next, run_workers, Reconciler};
