//! Volume replica reconciler
//!
//! Replicas live as datasets inside an imported pool, so nothing is consumed
//! before the pool reconciler has imported or created the node's pool. A
//! replica whose pool is missing is retried until that first import; after
//! it, a missing pool means the pool was lost and the replica is failed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::worker::Reconciler;
use crate::crd::condition::{
    find_condition, set_condition, EventReason, ResourceCondition, CONDITION_READY, CONDITION_SYNCED,
};
use crate::crd::{CStorVolumeReplica, CStorVolumeReplicaStatus, ReplicaPhase, REPLICA_FINALIZER};
use crate::domain::ports::ResourceStoreRef;
use crate::domain::types::{QueueOperation, QueuedWorkItem};
use crate::engine::{PoolEngine, ReplicaEngine};
use crate::error::{Error, Result};
use crate::sync::PoolEngineGate;

pub struct ReplicaReconciler {
    store: ResourceStoreRef<CStorVolumeReplica>,
    engine: ReplicaEngine,
    pools: PoolEngine,
    gate: Arc<PoolEngineGate>,
}

fn has_finalizer(cvr: &CStorVolumeReplica) -> bool {
    cvr.metadata
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|x| x == REPLICA_FINALIZER))
        .unwrap_or(false)
}

impl ReplicaReconciler {
    pub fn new(store: ResourceStoreRef<CStorVolumeReplica>, engine: ReplicaEngine, pools: PoolEngine) -> Self {
        let gate = pools.gate().clone();
        Self {
            store,
            engine,
            pools,
            gate,
        }
    }

    /// Block until the initial import completed and the engine reports a
    /// pool. Returns false on shutdown.
    pub async fn wait_for_pools(&self, interval: Duration, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => return false,
            _ = self.gate.wait_imported() => {}
        }
        loop {
            match self.pools.imported_pool_names().await {
                Ok(names) if !names.is_empty() => {
                    info!(pools = ?names, "Pool found, starting volume replica processing");
                    return true;
                }
                Ok(_) => info!("Waiting for pool to be imported"),
                Err(e) => warn!(error = %e, "Unable to list pools"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn write_status<F>(&self, cvr: &CStorVolumeReplica, update: F) -> Result<CStorVolumeReplica>
    where
        F: FnOnce(&mut CStorVolumeReplicaStatus),
    {
        let mut next = cvr.clone();
        let status = next.status.get_or_insert_with(Default::default);
        update(status);
        status.last_update_time = Some(Utc::now());
        self.store.update_status(&next).await
    }

    async fn set_phase(&self, cvr: &CStorVolumeReplica, phase: ReplicaPhase) -> Result<CStorVolumeReplica> {
        self.write_status(cvr, |status| status.phase = phase).await
    }

    async fn fail(&self, cvr: &CStorVolumeReplica, reason: EventReason, err: Error) -> Error {
        error!(replica = %cvr.name(), reason = %reason, error = %err, "{}", reason.message());
        let message = err.to_string();
        let written = self
            .write_status(cvr, |status| {
                status.phase = ReplicaPhase::Error;
                set_condition(
                    &mut status.conditions,
                    ResourceCondition::new(CONDITION_READY, reason, message),
                );
            })
            .await;
        if let Err(e) = written {
            warn!(replica = %cvr.name(), error = %e, "Unable to record replica failure");
        }
        err
    }

    async fn ensure_finalizer(&self, cvr: CStorVolumeReplica) -> Result<CStorVolumeReplica> {
        if has_finalizer(&cvr) {
            return Ok(cvr);
        }
        let mut next = cvr;
        next.metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(REPLICA_FINALIZER.to_string());
        self.store.update(&next).await
    }

    /// The hosting pool must be imported and usable
    async fn check_pool(&self, cvr: &CStorVolumeReplica, pool: &str) -> Result<()> {
        let names = self.pools.imported_pool_names().await?;
        if !names.iter().any(|name| name == pool) {
            if self.gate.is_imported() {
                let err = Error::PoolLost {
                    pool: pool.to_string(),
                };
                return Err(self.fail(cvr, EventReason::FailCreate, err).await);
            }
            return Err(Error::PoolPending {
                pool: pool.to_string(),
            });
        }

        let (health, _) = self.pools.status(pool).await?;
        if !health.is_usable() {
            return Err(Error::PoolUnavailable {
                pool: pool.to_string(),
                health: health.to_string(),
            });
        }
        Ok(())
    }

    async fn add(&self, cvr: CStorVolumeReplica) -> Result<()> {
        let cvr = self.ensure_finalizer(cvr).await?;
        let spec = match cvr.to_specification() {
            Ok(spec) => spec,
            Err(e) => return Err(self.fail(&cvr, EventReason::FailValidate, e).await),
        };
        self.check_pool(&cvr, &spec.pool_name()).await?;

        let dataset = spec.full_name();
        let (cvr, reason) = if self.gate.registry().take_initial_dataset(&dataset) {
            info!(dataset = %dataset, "Volume replica already present");
            (cvr, EventReason::AlreadyPresent)
        } else {
            let cvr = self.set_phase(&cvr, ReplicaPhase::Creating).await?;
            if let Err(e) = self.engine.create(&spec).await {
                return Err(self.fail(&cvr, EventReason::FailCreate, e).await);
            }
            (cvr, EventReason::Created)
        };

        self.refresh(cvr, &dataset, Some(reason)).await?;
        Ok(())
    }

    async fn update(&self, cvr: CStorVolumeReplica, operation: QueueOperation) -> Result<()> {
        if !cvr.has_been_available() {
            if operation == QueueOperation::Modify {
                // A replica that never came up is set up again from the new generation.
                if matches!(cvr.phase(), ReplicaPhase::Pending | ReplicaPhase::Error) {
                    info!(replica = %cvr.name(), phase = %cvr.phase(), "Spec changed before the replica came up, retrying add");
                    return self.add(cvr).await;
                }
                return Err(Error::NotReady {
                    key: cvr.name().to_string(),
                });
            }
            debug!(replica = %cvr.name(), phase = %cvr.phase(), "Skipping sync");
            return Ok(());
        }
        let spec = cvr.to_specification()?;
        self.refresh(cvr, &spec.full_name(), None).await?;
        Ok(())
    }

    async fn destroy(&self, cvr: CStorVolumeReplica) -> Result<()> {
        if !has_finalizer(&cvr) {
            return Ok(());
        }
        let cvr = if cvr.phase() == ReplicaPhase::Destroying {
            cvr
        } else {
            self.set_phase(&cvr, ReplicaPhase::Destroying).await?
        };

        match cvr.to_specification() {
            Ok(spec) => {
                if let Err(e) = self.engine.delete(&spec.full_name()).await {
                    return Err(self.fail(&cvr, EventReason::FailDestroy, e).await);
                }
            }
            Err(e) => warn!(replica = %cvr.name(), error = %e, "No dataset to destroy"),
        }

        let cvr = self.set_phase(&cvr, ReplicaPhase::Terminated).await?;
        let mut next = cvr.clone();
        if let Some(finalizers) = next.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != REPLICA_FINALIZER);
        }
        self.store.update(&next).await.map_err(|e| {
            error!(
                replica = %cvr.name(),
                reason = %EventReason::FailRemoveFinalizer,
                error = %e,
                "{}",
                EventReason::FailRemoveFinalizer.message()
            );
            e
        })?;
        Ok(())
    }

    async fn refresh(
        &self,
        cvr: CStorVolumeReplica,
        dataset: &str,
        reason: Option<EventReason>,
    ) -> Result<CStorVolumeReplica> {
        let health = self.engine.status(dataset).await.map_err(|e| {
            warn!(dataset = %dataset, reason = %EventReason::FailStatusSync, error = %e, "Replica status sync failed");
            e
        })?;
        let capacity = self.engine.capacity(dataset).await.map_err(|e| {
            warn!(dataset = %dataset, reason = %EventReason::FailCapacitySync, error = %e, "Replica capacity sync failed");
            e
        })?;

        self.write_status(&cvr, |status| {
            status.observe_health(health);
            status.capacity = capacity;
            let healthy = matches!(status.phase, ReplicaPhase::Available | ReplicaPhase::Degraded);
            match reason {
                Some(reason) => set_condition(
                    &mut status.conditions,
                    ResourceCondition::new(CONDITION_READY, reason, reason.message()),
                ),
                None => {
                    let stale = find_condition(&status.conditions, CONDITION_READY)
                        .map(|c| !c.is_true())
                        .unwrap_or(true);
                    if stale && healthy {
                        set_condition(
                            &mut status.conditions,
                            ResourceCondition::new(
                                CONDITION_READY,
                                EventReason::Synced,
                                EventReason::Synced.message(),
                            ),
                        );
                    }
                }
            }
            set_condition(
                &mut status.conditions,
                ResourceCondition::new(CONDITION_SYNCED, EventReason::Synced, format!("Replica is {}", health)),
            );
        })
        .await
    }
}

#[async_trait]
impl Reconciler for ReplicaReconciler {
    fn kind(&self) -> &'static str {
        "CStorVolumeReplica"
    }

    async fn reconcile(&self, item: &QueuedWorkItem) -> Result<()> {
        let namespace = item.key.namespace.as_deref();
        let Some(cvr) = self.store.get(namespace, &item.key.name).await? else {
            debug!(key = %item.key, "Volume replica resource is gone");
            return Ok(());
        };
        if cvr.is_deleting() {
            return self.destroy(cvr).await;
        }

        match item.operation {
            QueueOperation::Add => self.add(cvr).await,
            QueueOperation::Modify | QueueOperation::Sync => self.update(cvr, item.operation).await,
            QueueOperation::Destroy => {
                debug!(key = %item.key, "Volume replica is not being deleted, ignoring destroy");
                Ok(())
            }
        }
    }
}
