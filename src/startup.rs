//! Startup sequence and task supervision
//!
//! Order of startup:
//! 1. both resource definitions answer a list
//! 2. the pool engine answers `status`
//! 3. the engine watch, the informers and the pool workers start, and the
//!    datasets present on the node are recorded
//! 4. once a pool is imported the replica workers start
//!
//! Every long-running piece is a named task. The first one to fail cancels
//! the rest and its error is returned.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::watcher;
use kube::{Api, Client};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{
    OperatorConfig, CONTINUOUS_ENGINE_RETRY_INTERVAL, CRD_RETRY_INTERVAL,
    INITIAL_ENGINE_RETRY_INTERVAL, POOL_NAME_HANDLER_INTERVAL,
};
use crate::controller::{
    run_informer, run_workers, PoolReconciler, ReplicaReconciler, ResourceFilter, WorkQueue,
};
use crate::crd::{CStorPool, CStorVolumeReplica};
use crate::domain::ports::{CommandRunnerRef, ResourceStore, ResourceStoreRef};
use crate::domain::types::QueuedWorkItem;
use crate::engine::{PoolEngine, ReplicaEngine};
use crate::error::{Error, Result};
use crate::sync::PoolEngineGate;

/// Boxed long-running task
pub type Task = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

// =============================================================================
// Named Tasks
// =============================================================================

/// Join set whose tasks carry a name for logging
#[derive(Default)]
pub struct NamedTasks {
    set: JoinSet<(&'static str, Result<()>)>,
}

impl NamedTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        info!(task = name, "Starting task");
        self.set.spawn(async move { (name, task.await) });
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Wait for every task. The first failure cancels `shutdown` and is
    /// returned once the others have stopped.
    pub async fn join(mut self, shutdown: &CancellationToken) -> Result<()> {
        let mut first = None;
        while let Some(joined) = self.set.join_next().await {
            let failure = match joined {
                Ok((name, Ok(()))) => {
                    info!(task = name, "Task stopped");
                    None
                }
                Ok((name, Err(e))) => {
                    error!(task = name, error = %e, "Task failed");
                    Some(e)
                }
                Err(e) => {
                    error!(error = %e, "Task panicked");
                    Some(Error::Internal(format!("task panicked: {}", e)))
                }
            };
            if let Some(e) = failure {
                shutdown.cancel();
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

// =============================================================================
// Waits
// =============================================================================

/// Retry listing until the resource definition is installed. Returns false
/// on shutdown.
pub async fn wait_for_crd<K>(
    store: &dyn ResourceStore<K>,
    kind: &str,
    interval: Duration,
    shutdown: &CancellationToken,
) -> bool
where
    K: Send + Sync + 'static,
{
    loop {
        match store.list(None).await {
            Ok(_) => {
                info!(kind, "Resource definition found");
                return true;
            }
            Err(e) => {
                warn!(kind, error = %e, "Resource definition not found, retrying in {:?}", interval);
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => return false,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

// =============================================================================
// Informers
// =============================================================================

/// Only the pool resource named by the configured UID
pub fn pool_filter(config: &OperatorConfig) -> ResourceFilter<CStorPool> {
    let config = config.clone();
    Arc::new(move |csp: &CStorPool| config.owns_pool(csp.uid()))
}

/// Replicas are always watched through the pool UID label
pub fn replica_watcher_config(config: &OperatorConfig) -> watcher::Config {
    watcher::Config::default().labels(&config.replica_label_selector())
}

// =============================================================================
// Operator
// =============================================================================

/// Everything the node agent runs, wired around one gate
pub struct Operator {
    config: OperatorConfig,
    gate: Arc<PoolEngineGate>,
    pool_store: ResourceStoreRef<CStorPool>,
    replica_store: ResourceStoreRef<CStorVolumeReplica>,
    pool_engine: PoolEngine,
    replica_engine: ReplicaEngine,
    pool_queue: Arc<WorkQueue<QueuedWorkItem>>,
    replica_queue: Arc<WorkQueue<QueuedWorkItem>>,
}

impl Operator {
    pub fn new(
        config: OperatorConfig,
        runner: CommandRunnerRef,
        pool_store: ResourceStoreRef<CStorPool>,
        replica_store: ResourceStoreRef<CStorVolumeReplica>,
    ) -> Self {
        let gate = Arc::new(PoolEngineGate::new());
        let pool_engine = PoolEngine::new(runner.clone(), gate.clone(), config.pool_tool.clone());
        let replica_engine = ReplicaEngine::new(runner, gate.clone(), config.dataset_tool.clone());
        Self {
            config,
            gate,
            pool_store,
            replica_store,
            pool_engine,
            replica_engine,
            pool_queue: WorkQueue::new("CStorPool"),
            replica_queue: WorkQueue::new("CStorVolumeReplica"),
        }
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<PoolEngineGate> {
        &self.gate
    }

    pub fn pool_queue(&self) -> Arc<WorkQueue<QueuedWorkItem>> {
        self.pool_queue.clone()
    }

    pub fn replica_queue(&self) -> Arc<WorkQueue<QueuedWorkItem>> {
        self.replica_queue.clone()
    }

    /// Watchers for both kinds, restricted to the pool of this node
    pub fn informers(&self, client: &Client, shutdown: &CancellationToken) -> Vec<(&'static str, Task)> {
        let pools: Task = Box::pin(run_informer(
            Api::<CStorPool>::all(client.clone()),
            watcher::Config::default(),
            self.pool_queue(),
            self.config.resync_interval,
            Some(pool_filter(&self.config)),
            shutdown.clone(),
        ));
        let replicas: Task = Box::pin(run_informer(
            Api::<CStorVolumeReplica>::all(client.clone()),
            replica_watcher_config(&self.config),
            self.replica_queue(),
            self.config.resync_interval,
            None,
            shutdown.clone(),
        ));
        vec![("pool-informer", pools), ("replica-informer", replicas)]
    }

    /// Run until shutdown or the first fatal error. `informers` feed the two
    /// queues and are started once the engine is up.
    pub async fn run(self, informers: Vec<(&'static str, Task)>, shutdown: CancellationToken) -> Result<()> {
        self.config.validate()?;

        if !wait_for_crd(self.pool_store.as_ref(), "CStorPool", CRD_RETRY_INTERVAL, &shutdown).await
            || !wait_for_crd(
                self.replica_store.as_ref(),
                "CStorVolumeReplica",
                CRD_RETRY_INTERVAL,
                &shutdown,
            )
            .await
        {
            return Ok(());
        }

        match self
            .pool_engine
            .wait_for_engine(INITIAL_ENGINE_RETRY_INTERVAL, &shutdown)
            .await
        {
            Ok(()) => {}
            Err(_) if shutdown.is_cancelled() => return Ok(()),
            Err(e) => return Err(e),
        }

        let mut tasks = NamedTasks::new();

        let engine = self.pool_engine.clone();
        let token = shutdown.clone();
        tasks.spawn("engine-watch", async move {
            engine
                .watch_engine(CONTINUOUS_ENGINE_RETRY_INTERVAL, &token)
                .await
        });

        match self.replica_engine.list().await {
            Ok(datasets) => {
                info!(count = datasets.len(), "Recorded volume replicas present at startup");
                self.gate.registry().record_initial_datasets(datasets);
            }
            Err(e) => warn!(error = %e, "Unable to list volume replicas present at startup"),
        }

        for (name, informer) in informers {
            tasks.spawn(name, informer);
        }

        let pools = Arc::new(PoolReconciler::new(
            self.pool_store.clone(),
            self.pool_engine.clone(),
            self.config.read_only_release,
        ));
        tasks.spawn(
            "pool-workers",
            run_workers(self.pool_queue.clone(), pools, self.config.threads, shutdown.clone()),
        );

        let replicas = Arc::new(ReplicaReconciler::new(
            self.replica_store.clone(),
            self.replica_engine.clone(),
            self.pool_engine.clone(),
        ));
        let queue = self.replica_queue.clone();
        let threads = self.config.threads;
        let token = shutdown.clone();
        tasks.spawn("replica-workers", async move {
            if !replicas.wait_for_pools(POOL_NAME_HANDLER_INTERVAL, &token).await {
                queue.shut_down();
                return Ok(());
            }
            run_workers(queue, replicas, threads, token).await
        });

        tasks.join(&shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{fail, ok, FakeRunner};
    use crate::domain::types::Topology;
    use crate::store::MemoryStore;
    use assert_matches::assert_matches;

    fn config() -> OperatorConfig {
        OperatorConfig {
            cstor_id: "abcd".into(),
            ..OperatorConfig::default()
        }
    }

    fn operator(fake: &FakeRunner) -> Operator {
        Operator::new(
            config(),
            Arc::new(fake.clone()),
            Arc::new(MemoryStore::<CStorPool>::new()),
            Arc::new(MemoryStore::<CStorVolumeReplica>::new()),
        )
    }

    #[tokio::test]
    async fn test_named_tasks_propagate_first_failure() {
        let shutdown = CancellationToken::new();
        let mut tasks = NamedTasks::new();
        let token = shutdown.clone();
        tasks.spawn("waits", async move {
            token.cancelled().await;
            Ok(())
        });
        tasks.spawn("fails", async { Err(Error::EngineLost("gone".into())) });
        assert_eq!(tasks.len(), 2);

        let result = tokio::time::timeout(Duration::from_secs(1), tasks.join(&shutdown))
            .await
            .unwrap();
        assert_matches!(result, Err(Error::EngineLost(_)));
        assert!(shutdown.is_cancelled());
    }

    #[test]
    fn test_watchers_are_scoped_to_the_node_pool() {
        let config = config();
        assert_eq!(
            replica_watcher_config(&config).label_selector.as_deref(),
            Some("cstorpool.openebs.io/uid=abcd")
        );

        let filter = pool_filter(&config);
        let own = crate::testing::pool_resource("abcd", Topology::Striped, &["d1"]);
        let foreign = crate::testing::pool_resource("efgh", Topology::Striped, &["d1"]);
        assert!(filter(&own));
        assert!(!filter(&foreign));
    }

    #[tokio::test]
    async fn test_run_requires_pool_uid() {
        let fake = FakeRunner::new();
        let operator = Operator::new(
            OperatorConfig::default(),
            Arc::new(fake.clone()),
            Arc::new(MemoryStore::<CStorPool>::new()),
            Arc::new(MemoryStore::<CStorVolumeReplica>::new()),
        );
        let result = operator.run(Vec::new(), CancellationToken::new()).await;
        assert_matches!(result, Err(Error::Configuration(_)));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_crd() {
        let store = MemoryStore::<CStorPool>::new();
        let shutdown = CancellationToken::new();
        assert!(wait_for_crd(&store, "CStorPool", Duration::from_millis(5), &shutdown).await);
    }

    #[tokio::test]
    async fn test_engine_loss_is_fatal() {
        let fake = FakeRunner::new();
        fake.on("status", fail("failed to connect to the engine"));
        fake.on_times("status", ok(""), 1);
        let operator = operator(&fake);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            operator.run(Vec::new(), CancellationToken::new()),
        )
        .await
        .unwrap();
        assert_matches!(result, Err(Error::EngineLost(_)));
    }

    #[tokio::test]
    async fn test_run_records_datasets_and_stops_on_shutdown() {
        let fake = FakeRunner::new();
        fake.on_tool("zfs", "list", ok("cstor-abcd/pvc-1\n"));
        let operator = operator(&fake);
        let gate = operator.gate().clone();
        let pool_queue = operator.pool_queue();
        let shutdown = CancellationToken::new();

        let informer_stopped = shutdown.clone();
        let informers: Vec<(&'static str, Task)> = vec![(
            "pool-informer",
            Box::pin(async move {
                informer_stopped.cancelled().await;
                Ok(())
            }),
        )];
        let handle = tokio::spawn(operator.run(informers, shutdown.clone()));

        for _ in 0..100 {
            if fake.count("list") > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gate.registry().take_initial_dataset("cstor-abcd/pvc-1"));
        // Replica workers hold back until a pool is imported.
        assert!(!gate.is_imported());

        shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(pool_queue.is_shutting_down());
    }
}
