//! Pool reconciler
//!
//! Drives a `CStorPool` resource through its lifecycle:
//!
//! ```text
//! Pending -> [Importing] -> Creating -> Available/Degraded/Offline
//!                                  \-> Error
//! (deletion) -> Destroying -> Terminated, finalizer removed
//! ```
//!
//! An Add first looks for the pool among the imported ones, then tries to
//! import it with the cache file and with the device directory, and only
//! then creates it. Sync and Modify refresh health and capacity and apply
//! the read-only policy; their failures are retried without touching the
//! phase.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::worker::Reconciler;
use crate::config::ReadOnlyRelease;
use crate::crd::condition::{
    find_condition, set_condition, EventReason, ResourceCondition, CONDITION_READ_ONLY_THRESHOLD,
    CONDITION_READY, CONDITION_SYNCED,
};
use crate::crd::{
    CStorPool, CStorPoolStatus, PoolPhase, POOL_FINALIZER, RELEASE_READ_ONLY_ANNOTATION,
};
use crate::domain::ports::ResourceStoreRef;
use crate::domain::types::{
    pool_name, ImportOptions, PoolRuntimeStatus, PoolSpecification, QueueOperation,
    QueuedWorkItem, DEFAULT_RO_THRESHOLD_PERCENT,
};
use crate::engine::builder::dev_path_if_not_slash_dev;
use crate::engine::{CreateOutcome, PoolEngine};
use crate::error::{Error, Result};
use crate::sync::PoolEngineGate;

// =============================================================================
// Read-only Policy
// =============================================================================

/// Inputs of the read-only decision for one refresh
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadOnlyInputs {
    /// Administrative intent from the resource spec
    pub admin: bool,
    /// The administrator just switched read-only off
    pub admin_released: bool,
    /// The threshold latch recorded in the status
    pub latched: bool,
    /// The release annotation is present
    pub release_requested: bool,
    pub used_percent: Option<f64>,
    /// Threshold in percent; 0 means the default
    pub threshold: u32,
    pub policy: ReadOnlyRelease,
}

/// Outcome of the read-only decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOnlyDecision {
    /// Read-only state the pool must end up in
    pub read_only: bool,
    /// Latch state to record
    pub latched: bool,
    /// The latch was set by this decision
    pub newly_latched: bool,
    /// The latch was cleared by this decision
    pub released: bool,
}

/// Combine the administrative intent with the capacity threshold latch.
///
/// The latch is set once used capacity reaches the threshold. It is cleared
/// by the release annotation, by the administrator switching read-only off,
/// or under [`ReadOnlyRelease::OnRecovery`] once usage is known to be below
/// the threshold. A release while still over the threshold latches again.
pub fn read_only_decision(inputs: ReadOnlyInputs) -> ReadOnlyDecision {
    let threshold = match inputs.threshold {
        0 => DEFAULT_RO_THRESHOLD_PERCENT,
        t => t,
    } as f64;
    let over = inputs.used_percent.map(|used| used >= threshold);

    let mut latched = inputs.latched;
    let mut released = false;
    if latched {
        let recovered = inputs.policy == ReadOnlyRelease::OnRecovery && over == Some(false);
        if inputs.release_requested || inputs.admin_released || recovered {
            latched = false;
            released = true;
        }
    }

    let mut newly_latched = false;
    if over == Some(true) && !latched {
        latched = true;
        newly_latched = true;
        released = false;
    }

    ReadOnlyDecision {
        read_only: inputs.admin || latched,
        latched,
        newly_latched,
        released,
    }
}

// =============================================================================
// Reconciler
// =============================================================================

pub struct PoolReconciler {
    store: ResourceStoreRef<CStorPool>,
    engine: PoolEngine,
    gate: Arc<PoolEngineGate>,
    release: ReadOnlyRelease,
}

fn has_finalizer(csp: &CStorPool) -> bool {
    csp.metadata
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|x| x == POOL_FINALIZER))
        .unwrap_or(false)
}

fn ready(reason: EventReason, message: impl Into<String>) -> ResourceCondition {
    ResourceCondition::new(CONDITION_READY, reason, message)
}

impl PoolReconciler {
    pub fn new(store: ResourceStoreRef<CStorPool>, engine: PoolEngine, release: ReadOnlyRelease) -> Self {
        let gate = engine.gate().clone();
        Self {
            store,
            engine,
            gate,
            release,
        }
    }

    // =========================================================================
    // Resource Writes
    // =========================================================================

    async fn write_status<F>(&self, csp: &CStorPool, update: F) -> Result<CStorPool>
    where
        F: FnOnce(&mut CStorPoolStatus),
    {
        let mut next = csp.clone();
        let status = next.status.get_or_insert_with(Default::default);
        update(status);
        status.last_update_time = Some(Utc::now());
        self.store.update_status(&next).await
    }

    async fn set_phase(&self, csp: &CStorPool, phase: PoolPhase) -> Result<CStorPool> {
        self.write_status(csp, |status| status.phase = phase).await
    }

    /// Record a failure on the resource and hand back the original error
    async fn fail(&self, csp: &CStorPool, reason: EventReason, err: Error) -> Error {
        error!(pool = %csp.name(), reason = %reason, error = %err, "{}", reason.message());
        let message = err.to_string();
        let written = self
            .write_status(csp, |status| {
                status.phase = PoolPhase::Error;
                set_condition(&mut status.conditions, ready(reason, message));
            })
            .await;
        if let Err(e) = written {
            warn!(pool = %csp.name(), error = %e, "Unable to record pool failure");
        }
        err
    }

    async fn ensure_finalizer(&self, csp: CStorPool) -> Result<CStorPool> {
        if has_finalizer(&csp) {
            return Ok(csp);
        }
        let mut next = csp;
        next.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(POOL_FINALIZER.to_string());
        self.store.update(&next).await
    }

    async fn remove_finalizer(&self, csp: &CStorPool) -> Result<()> {
        let mut next = csp.clone();
        if let Some(finalizers) = next.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != POOL_FINALIZER);
        }
        self.store.update(&next).await.map_err(|e| {
            error!(
                pool = %csp.name(),
                reason = %EventReason::FailRemoveFinalizer,
                error = %e,
                "{}",
                EventReason::FailRemoveFinalizer.message()
            );
            e
        })?;
        Ok(())
    }

    async fn clear_release_annotation(&self, csp: CStorPool) -> Result<CStorPool> {
        let mut next = csp;
        if let Some(annotations) = next.metadata.annotations.as_mut() {
            annotations.remove(RELEASE_READ_ONLY_ANNOTATION);
        }
        self.store.update(&next).await
    }

    // =========================================================================
    // Operations
    // =========================================================================

    async fn add(&self, csp: CStorPool) -> Result<()> {
        let csp = self.ensure_finalizer(csp).await?;
        let spec = match csp.to_specification() {
            Ok(spec) => spec,
            Err(e) => return Err(self.fail(&csp, EventReason::FailValidate, e).await),
        };
        let pool = spec.pool_name();

        let (csp, reason) = if self.engine.imported_pool_names().await?.contains(&pool) {
            info!(pool = %pool, rname = %spec.name, "Pool already present");
            (csp, EventReason::AlreadyPresent)
        } else {
            match self.import(csp, &spec).await? {
                (csp, true) => (csp, EventReason::Imported),
                (csp, false) => self.create(csp, &spec).await?,
            }
        };

        self.gate.registry().record_spec(&spec);
        self.gate.mark_imported();
        self.refresh(csp, &spec, Some(reason), false).await?;
        Ok(())
    }

    /// Try the cache file, then the device directory. The flag is false when
    /// neither import found the pool.
    async fn import(&self, csp: CStorPool, spec: &PoolSpecification) -> Result<(CStorPool, bool)> {
        let csp = if csp.has_been_available() {
            self.set_phase(&csp, PoolPhase::Importing).await?
        } else {
            csp
        };

        let mut attempts = Vec::new();
        if !spec.cache_file.is_empty() {
            attempts.push(ImportOptions::with_cachefile());
        }
        let first = spec.device_ids().into_iter().next();
        attempts.push(ImportOptions {
            dev_path: first.as_deref().and_then(dev_path_if_not_slash_dev),
            ..Default::default()
        });

        for options in &attempts {
            match self.engine.import(spec, options).await {
                Ok(_) => {
                    if !spec.cache_file.is_empty() {
                        if let Err(e) = self.engine.set_cachefile(spec).await {
                            warn!(pool = %spec.pool_name(), error = %e, "Unable to set pool cache file");
                        }
                    }
                    return Ok((csp, true));
                }
                Err(Error::ImportFailed { .. }) => continue,
                Err(e) => return Err(self.fail(&csp, EventReason::FailImport, e).await),
            }
        }
        Ok((csp, false))
    }

    async fn create(&self, csp: CStorPool, spec: &PoolSpecification) -> Result<(CStorPool, EventReason)> {
        if let Err(e) = spec.validate() {
            return Err(self.fail(&csp, EventReason::FailValidate, e).await);
        }
        let csp = self.set_phase(&csp, PoolPhase::Creating).await?;

        match self.engine.create(spec).await {
            Ok(CreateOutcome::Created) => Ok((csp, EventReason::Created)),
            Ok(CreateOutcome::AlreadyImported) => Ok((csp, EventReason::AlreadyPresent)),
            Err(e) => Err(self.fail(&csp, EventReason::FailCreate, e).await),
        }
    }

    async fn modify(&self, csp: CStorPool) -> Result<()> {
        if !csp.has_been_available() {
            // A pool that never came up is set up again from the new generation.
            if matches!(csp.phase(), PoolPhase::Pending | PoolPhase::Error) {
                info!(pool = %csp.name(), phase = %csp.phase(), "Spec changed before the pool came up, retrying add");
                return self.add(csp).await;
            }
            return Err(Error::NotReady {
                key: csp.name().to_string(),
            });
        }
        let spec = csp.to_specification()?;
        let previous = self.gate.registry().spec(&spec.uid);

        let cache_changed = previous
            .as_ref()
            .map(|p| p.cache_file != spec.cache_file)
            .unwrap_or(false);
        if cache_changed && !spec.cache_file.is_empty() {
            self.engine.set_cachefile(&spec).await?;
            info!(pool = %spec.pool_name(), cache_file = %spec.cache_file, "Pool cache file updated");
        }
        let admin_released = previous
            .as_ref()
            .map(|p| p.read_only && !spec.read_only)
            .unwrap_or(false);

        self.gate.registry().record_spec(&spec);
        self.refresh(csp, &spec, None, admin_released).await?;
        Ok(())
    }

    async fn sync(&self, csp: CStorPool) -> Result<()> {
        match csp.phase() {
            PoolPhase::Pending
            | PoolPhase::Importing
            | PoolPhase::Creating
            | PoolPhase::Destroying
            | PoolPhase::Terminated => {
                debug!(pool = %csp.name(), phase = %csp.phase(), "Skipping sync");
                return Ok(());
            }
            _ => {}
        }
        if !csp.has_been_available() {
            return Ok(());
        }
        let spec = csp.to_specification()?;
        if self.gate.registry().spec(&spec.uid).is_none() {
            self.gate.registry().record_spec(&spec);
        }
        self.refresh(csp, &spec, None, false).await?;
        Ok(())
    }

    async fn destroy(&self, csp: CStorPool) -> Result<()> {
        if !has_finalizer(&csp) {
            return Ok(());
        }
        let uid = csp.uid().to_string();

        let csp = if csp.phase() == PoolPhase::Destroying {
            csp
        } else {
            self.set_phase(&csp, PoolPhase::Destroying).await?
        };

        if !uid.is_empty() {
            if let Err(e) = self.engine.delete(&pool_name(&uid)).await {
                return Err(self.fail(&csp, EventReason::FailDestroy, e).await);
            }
            self.gate.registry().remove(&uid);
        }

        let csp = self.set_phase(&csp, PoolPhase::Terminated).await?;
        self.remove_finalizer(&csp).await
    }

    /// Query health and capacity, apply the read-only policy and write the
    /// result. Failures are logged and returned without any status write.
    async fn refresh(
        &self,
        csp: CStorPool,
        spec: &PoolSpecification,
        reason: Option<EventReason>,
        admin_released: bool,
    ) -> Result<CStorPool> {
        let pool = spec.pool_name();
        let (health, observed_read_only) = self.engine.status(&pool).await.map_err(|e| {
            warn!(pool = %pool, reason = %EventReason::FailStatusSync, error = %e, "Pool status sync failed");
            e
        })?;
        let capacity = self.engine.capacity(&pool).await.map_err(|e| {
            warn!(pool = %pool, reason = %EventReason::FailCapacitySync, error = %e, "Pool capacity sync failed");
            e
        })?;

        let decision = read_only_decision(ReadOnlyInputs {
            admin: spec.read_only,
            admin_released,
            latched: csp.status.as_ref().map(|s| s.threshold_latched).unwrap_or(false),
            release_requested: csp.release_requested(),
            used_percent: capacity.used_percent(),
            threshold: spec.ro_threshold_percent,
            policy: self.release,
        });
        if decision.newly_latched {
            warn!(
                eventcode = "cstor.pool.readonly.threshold",
                rname = %spec.name,
                pool = %pool,
                used = %capacity.used,
                total = %capacity.total,
                threshold = spec.ro_threshold_percent,
                "{}",
                EventReason::PoolReadOnlyThreshold.message()
            );
        }
        if decision.released {
            info!(pool = %pool, "Pool read-only threshold latch released");
        }
        if decision.read_only != observed_read_only {
            self.engine.set_read_only(&pool, decision.read_only).await?;
        }

        let csp = if csp.release_requested() {
            self.clear_release_annotation(csp).await?
        } else {
            csp
        };

        self.gate.registry().record_status(
            &spec.uid,
            PoolRuntimeStatus {
                health,
                read_only: decision.read_only,
                capacity: capacity.clone(),
            },
        );

        self.write_status(&csp, |status| {
            status.observe_health(health);
            status.capacity = capacity;
            status.read_only = decision.read_only;
            status.threshold_latched = decision.latched;

            match reason {
                Some(reason) => set_condition(&mut status.conditions, ready(reason, reason.message())),
                None => {
                    let stale = find_condition(&status.conditions, CONDITION_READY)
                        .map(|c| !c.is_true())
                        .unwrap_or(true);
                    if stale && health.is_usable() {
                        set_condition(
                            &mut status.conditions,
                            ready(EventReason::Synced, EventReason::Synced.message()),
                        );
                    }
                }
            }
            set_condition(
                &mut status.conditions,
                ResourceCondition::new(CONDITION_SYNCED, EventReason::Synced, format!("Pool is {}", health)),
            );

            if decision.latched {
                set_condition(
                    &mut status.conditions,
                    ResourceCondition::with_status(
                        CONDITION_READ_ONLY_THRESHOLD,
                        true,
                        EventReason::PoolReadOnlyThreshold,
                        EventReason::PoolReadOnlyThreshold.message(),
                    ),
                );
            } else if find_condition(&status.conditions, CONDITION_READ_ONLY_THRESHOLD)
                .map(|c| c.is_true())
                .unwrap_or(false)
            {
                set_condition(
                    &mut status.conditions,
                    ResourceCondition::with_status(
                        CONDITION_READ_ONLY_THRESHOLD,
                        false,
                        EventReason::Synced,
                        "Read-only threshold released",
                    ),
                );
            }
        })
        .await
    }
}

#[async_trait]
impl Reconciler for PoolReconciler {
    fn kind(&self) -> &'static str {
        "CStorPool"
    }

    async fn reconcile(&self, item: &QueuedWorkItem) -> Result<()> {
        let Some(csp) = self.store.get(None, &item.key.name).await? else {
            debug!(key = %item.key, "Pool resource is gone");
            return Ok(());
        };
        if csp.is_deleting() {
            return self.destroy(csp).await;
        }

        match item.operation {
            QueueOperation::Add => self.add(csp).await,
            QueueOperation::Modify => self.modify(csp).await,
            QueueOperation::Sync => self.sync(csp).await,
            QueueOperation::Destroy => {
                debug!(key = %item.key, "Pool resource is not being deleted, ignoring destroy");
                Ok(())
            }
        }
    }
}
