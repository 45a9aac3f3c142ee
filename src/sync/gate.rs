//! Serialization gate for the pool engine
//!
//! The engine is one stateful process per node. Every sequence of commands
//! that mutates it (existence check followed by create, destroy, property
//! changes) runs while holding the gate's lock, so two workers can never
//! interleave their sequences. The gate also carries the one-shot "initial
//! import completed" latch and an advisory registry of known pools.

use dashmap::{DashMap, DashSet};
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::info;

use crate::domain::types::{PoolRuntimeStatus, PoolSpecification};

// =============================================================================
// Imported Pool Registry
// =============================================================================

/// Advisory cache of the pools this process has seen.
///
/// The engine stays authoritative; entries here are only used for logging,
/// readiness reporting and to skip redundant work.
#[derive(Debug, Default)]
pub struct ImportedPoolRegistry {
    specs: DashMap<String, PoolSpecification>,
    statuses: DashMap<String, PoolRuntimeStatus>,
    initial_datasets: DashSet<String>,
}

impl ImportedPoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_spec(&self, spec: &PoolSpecification) {
        self.specs.insert(spec.uid.clone(), spec.clone());
    }

    pub fn record_status(&self, uid: &str, status: PoolRuntimeStatus) {
        self.statuses.insert(uid.to_string(), status);
    }

    pub fn spec(&self, uid: &str) -> Option<PoolSpecification> {
        self.specs.get(uid).map(|s| s.value().clone())
    }

    /// Last observed status of every known pool, ordered by UID
    pub fn statuses(&self) -> Vec<(String, PoolRuntimeStatus)> {
        let mut statuses: Vec<(String, PoolRuntimeStatus)> = self
            .statuses
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        statuses
    }

    pub fn remove(&self, uid: &str) {
        self.specs.remove(uid);
        self.statuses.remove(uid);
    }

    /// Remember the datasets that existed when the process started
    pub fn record_initial_datasets<I>(&self, datasets: I)
    where
        I: IntoIterator<Item = String>,
    {
        for dataset in datasets {
            self.initial_datasets.insert(dataset);
        }
    }

    /// Consume the startup record of a dataset; true only on the first call
    pub fn take_initial_dataset(&self, dataset: &str) -> bool {
        self.initial_datasets.remove(dataset).is_some()
    }
}

// =============================================================================
// Gate
// =============================================================================

/// Process-wide gate shared by all reconcilers
#[derive(Debug)]
pub struct PoolEngineGate {
    lock: Mutex<()>,
    imported: watch::Sender<bool>,
    registry: ImportedPoolRegistry,
}

impl Default for PoolEngineGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolEngineGate {
    pub fn new() -> Self {
        let (imported, _) = watch::channel(false);
        Self {
            lock: Mutex::new(()),
            imported,
            registry: ImportedPoolRegistry::new(),
        }
    }

    /// Acquire exclusive access to the engine. Hold the guard across the
    /// whole command sequence.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    /// Set the initial import latch. Later calls are no-ops.
    pub fn mark_imported(&self) {
        let changed = self.imported.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        });
        if changed {
            info!("Initial pool import completed");
        }
    }

    pub fn is_imported(&self) -> bool {
        *self.imported.borrow()
    }

    /// Wait until the initial import latch is set
    pub async fn wait_imported(&self) {
        let mut rx = self.imported.subscribe();
        // The sender lives as long as self, so the channel cannot close here.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Watch handle on the latch, for tasks that outlive a borrow of the gate
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.imported.subscribe()
    }

    pub fn registry(&self) -> &ImportedPoolRegistry {
        &self.registry
    }
}
