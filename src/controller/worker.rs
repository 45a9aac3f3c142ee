//! Worker runtime shared by the reconcilers

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::WorkQueue;
use crate::domain::types::QueuedWorkItem;
use crate::error::{ErrorAction, Result};
use crate::telemetry;

/// One reconciler: maps a work item to engine commands and status writes
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Resource kind, used in logs and metrics
    fn kind(&self) -> &'static str;

    async fn reconcile(&self, item: &QueuedWorkItem) -> Result<()>;
}

/// Pull one item and reconcile it. Returns false once the queue is shut down.
pub async fn process_next(
    queue: &Arc<WorkQueue<QueuedWorkItem>>,
    reconciler: &dyn Reconciler,
) -> bool {
    let Some(item) = queue.get().await else {
        return false;
    };
    let kind = reconciler.kind();
    let operation = item.operation.to_string();

    match reconciler.reconcile(&item).await {
        Ok(()) => {
            debug!(kind, key = %item.key, op = %operation, "Reconciled");
            queue.forget(&item);
            telemetry::record_reconcile(kind, &operation, "success");
        }
        Err(e) => match e.action() {
            ErrorAction::NoRequeue => {
                warn!(kind, key = %item.key, op = %operation, error = %e, "Reconcile failed, not retrying");
                queue.forget(&item);
                telemetry::record_reconcile(kind, &operation, "terminal");
            }
            ErrorAction::RequeueAfter(delay) => {
                info!(kind, key = %item.key, op = %operation, reason = %e, delay = ?delay, "Requeueing");
                queue.forget(&item);
                queue.add_after(item.clone(), delay);
                telemetry::record_reconcile(kind, &operation, "requeued");
            }
            ErrorAction::RequeueWithBackoff => {
                if e.is_contract_violation() {
                    error!(kind, key = %item.key, op = %operation, error = %e, "Unexpected engine output");
                } else {
                    warn!(
                        kind,
                        key = %item.key,
                        op = %operation,
                        error = %e,
                        retries = queue.num_requeues(&item),
                        "Reconcile failed, retrying"
                    );
                }
                queue.add_rate_limited(item.clone());
                telemetry::record_reconcile(kind, &operation, "error");
            }
        },
    }

    queue.done(&item);
    true
}

/// Run `threads` workers until shutdown. In-flight items finish; queued ones
/// are dropped.
pub async fn run_workers(
    queue: Arc<WorkQueue<QueuedWorkItem>>,
    reconciler: Arc<dyn Reconciler>,
    threads: usize,
    shutdown: CancellationToken,
) -> Result<()> {
    let kind = reconciler.kind();
    let mut workers = JoinSet::new();
    for id in 0..threads.max(1) {
        let queue = queue.clone();
        let reconciler = reconciler.clone();
        workers.spawn(async move {
            debug!(kind = reconciler.kind(), worker = id, "Worker started");
            while process_next(&queue, reconciler.as_ref()).await {}
            debug!(kind = reconciler.kind(), worker = id, "Worker stopped");
        });
    }
    info!(kind, threads = threads.max(1), "Started workers");

    shutdown.cancelled().await;
    queue.shut_down();
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(kind, error = %e, "Worker panicked");
        }
    }
    info!(kind, "Shutting down workers");
    Ok(())
}
