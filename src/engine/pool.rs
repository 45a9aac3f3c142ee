//! Pool lifecycle and queries against the pool tool
//!
//! Every method except the liveness probes holds the gate for its whole
//! command sequence. Methods suffixed `_locked` expect the caller to hold it.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{builder, command_failed, execute, execute_checked, parser};
use crate::domain::ports::CommandRunnerRef;
use crate::domain::types::{ImportOptions, PoolCapacity, PoolHealth, PoolSpecification};
use crate::error::{Error, Result};
use crate::sync::PoolEngineGate;

/// Result of a create request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The pool was created
    Created,
    /// The pool was already imported; nothing was run
    AlreadyImported,
}

/// Client for the pool tool
#[derive(Clone)]
pub struct PoolEngine {
    runner: CommandRunnerRef,
    gate: Arc<PoolEngineGate>,
    tool: String,
}

impl PoolEngine {
    pub fn new(runner: CommandRunnerRef, gate: Arc<PoolEngineGate>, tool: impl Into<String>) -> Self {
        Self {
            runner,
            gate,
            tool: tool.into(),
        }
    }

    pub fn gate(&self) -> &Arc<PoolEngineGate> {
        &self.gate
    }

    // =========================================================================
    // Import / Create / Delete
    // =========================================================================

    /// Import the pool and confirm it with `status <pool>`.
    ///
    /// Returns the combined output of the import command.
    pub async fn import(&self, spec: &PoolSpecification, options: &ImportOptions) -> Result<String> {
        let _guard = self.gate.lock().await;
        self.import_locked(spec, options).await
    }

    async fn import_locked(&self, spec: &PoolSpecification, options: &ImportOptions) -> Result<String> {
        let pool = spec.pool_name();
        let args = builder::import(spec, options);
        let output = execute(self.runner.as_ref(), &self.tool, &args).await?;
        let combined = output.combined_str();

        if !output.success {
            error!(
                eventcode = "cstor.pool.import.failure",
                rname = %spec.name,
                pool = %pool,
                dev_path = ?options.dev_path,
                cachefile = options.cachefile_flag,
                output = %combined.trim(),
                "Failed to import CStor pool"
            );
            return Err(Error::ImportFailed {
                pool,
                reason: combined.trim().to_string(),
            });
        }

        info!(
            pool = %pool,
            dev_path = ?options.dev_path,
            cachefile = options.cachefile_flag,
            "Import command successful"
        );

        let status_args = builder::pool_status(&pool);
        let status = execute(self.runner.as_ref(), &self.tool, &status_args).await?;
        if !status.success {
            error!(pool = %pool, output = %status.combined_str().trim(), "Unable to get pool status");
            return Err(Error::ImportConfirmation {
                pool,
                reason: status.combined_str().trim().to_string(),
            });
        }

        info!(
            eventcode = "cstor.pool.import.success",
            rname = %spec.name,
            pool = %pool,
            "CStor pool imported successfully"
        );
        Ok(combined)
    }

    /// Whether the tool can see the pool on its devices without importing it
    async fn exists_not_imported_locked(&self, spec: &PoolSpecification) -> Result<bool> {
        let first = spec.device_ids().into_iter().next();
        let dev_path = first.as_deref().and_then(builder::dev_path_if_not_slash_dev);
        let args = builder::import(spec, &ImportOptions::probe(dev_path));

        // A probe that finds nothing exits non-zero; only the text matters.
        let output = execute(self.runner.as_ref(), &self.tool, &args).await?;
        let combined = output.combined_str();
        debug!(pool = %spec.pool_name(), output = %combined.trim(), "Pool existence probe");
        Ok(combined.contains(&spec.pool_name()))
    }

    /// Create the pool unless it is already imported.
    ///
    /// The already-imported check, the existence probe, label clearing and the
    /// create itself run as one sequence under the gate.
    pub async fn create(&self, spec: &PoolSpecification) -> Result<CreateOutcome> {
        spec.validate()?;
        let pool = spec.pool_name();
        let _guard = self.gate.lock().await;

        let existing = self.imported_pool_names_locked().await?;
        if existing.iter().any(|name| *name == pool) {
            info!(pool = %pool, "Pool already imported");
            return Ok(CreateOutcome::AlreadyImported);
        }

        if self.exists_not_imported_locked(spec).await? {
            error!(pool = %pool, "Pool exists, but failed to import");
            return Err(Error::PoolExistsNotImported { pool });
        }

        let devices = spec.device_ids();
        match self.label_clear_locked(&devices).await {
            Ok(()) => info!(pool = %pool, "Label clear successful"),
            Err(e) => warn!(pool = %pool, error = %e, "Label clear failed"),
        }

        let args = builder::create(spec);
        debug!(pool = %pool, args = ?args, "Creating pool");
        let output = execute(self.runner.as_ref(), &self.tool, &args).await?;
        if !output.success {
            error!(
                eventcode = "cstor.pool.create.failure",
                rname = %spec.name,
                pool = %pool,
                output = %output.combined_str().trim(),
                "Failed to create CStor pool"
            );
            return Err(command_failed(&self.tool, &args, &output));
        }

        info!(
            eventcode = "cstor.pool.create.success",
            rname = %spec.name,
            pool = %pool,
            "CStor pool created successfully"
        );
        Ok(CreateOutcome::Created)
    }

    /// Destroy the pool. A pool that is already gone counts as destroyed.
    pub async fn delete(&self, pool: &str) -> Result<()> {
        let _guard = self.gate.lock().await;
        let args = builder::destroy(pool);
        let output = execute(self.runner.as_ref(), &self.tool, &args).await?;
        if output.success {
            info!(eventcode = "cstor.pool.delete.success", rname = %pool, "CStor pool deleted successfully");
            return Ok(());
        }

        let combined = output.combined_str();
        if combined.contains(parser::NO_SUCH_POOL) {
            info!(pool = %pool, output = %combined.trim(), "Assuming pool deletion successful");
            return Ok(());
        }

        error!(
            eventcode = "cstor.pool.delete.failure",
            rname = %pool,
            output = %combined.trim(),
            "Failed to delete CStor pool"
        );
        Err(command_failed(&self.tool, &args, &output))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Names of the pools the engine currently has imported
    pub async fn imported_pool_names(&self) -> Result<Vec<String>> {
        let _guard = self.gate.lock().await;
        self.imported_pool_names_locked().await
    }

    async fn imported_pool_names_locked(&self) -> Result<Vec<String>> {
        let args = builder::list_names();
        let output = execute_checked(self.runner.as_ref(), &self.tool, &args).await?;
        Ok(parser::names(&output.stdout_str()))
    }

    /// Health and read-only flag of a pool
    pub async fn status(&self, pool: &str) -> Result<(PoolHealth, bool)> {
        let _guard = self.gate.lock().await;
        let args = builder::status(pool);
        let output = execute_checked(self.runner.as_ref(), &self.tool, &args)
            .await
            .map_err(|e| {
                error!(pool = %pool, error = %e, "Unable to get pool status");
                e
            })?;
        parser::pool_status(&output.combined_str())
    }

    /// Capacity of a pool; a missing free or used value is an error
    pub async fn capacity(&self, pool: &str) -> Result<PoolCapacity> {
        let _guard = self.gate.lock().await;
        let args = builder::capacity(pool);
        let output = execute_checked(self.runner.as_ref(), &self.tool, &args).await?;
        let capacity = parser::pool_capacity(&output.combined_str());

        for (field, value) in [("used", &capacity.used), ("free", &capacity.free)] {
            if value.trim().is_empty() {
                return Err(Error::MissingCapacityField {
                    pool: pool.to_string(),
                    field: field.to_string(),
                });
            }
        }
        Ok(capacity)
    }

    // =========================================================================
    // Property Changes
    // =========================================================================

    pub async fn set_read_only(&self, pool: &str, read_only: bool) -> Result<()> {
        let _guard = self.gate.lock().await;
        let args = builder::set_read_only(pool, read_only);
        execute_checked(self.runner.as_ref(), &self.tool, &args).await?;
        info!(pool = %pool, read_only, "Pool read-only property updated");
        Ok(())
    }

    pub async fn set_cachefile(&self, spec: &PoolSpecification) -> Result<()> {
        let _guard = self.gate.lock().await;
        let args = builder::set_cachefile(spec);
        execute_checked(self.runner.as_ref(), &self.tool, &args).await?;
        Ok(())
    }

    /// Clear pool labels on every device, even after a failure
    pub async fn label_clear(&self, devices: &[String]) -> Result<()> {
        let _guard = self.gate.lock().await;
        self.label_clear_locked(devices).await
    }

    async fn label_clear_locked(&self, devices: &[String]) -> Result<()> {
        let mut failed = Vec::new();
        for device in devices {
            let args = builder::label_clear(device);
            match execute(self.runner.as_ref(), &self.tool, &args).await {
                Ok(output) if output.success => {
                    info!(device = %device, "Successfully cleared label on block device");
                }
                Ok(output) => {
                    error!(
                        device = %device,
                        output = %output.combined_str().trim(),
                        "Unable to clear label on block device"
                    );
                    failed.push(device.clone());
                }
                Err(e) => {
                    error!(device = %device, error = %e, "Unable to clear label on block device");
                    failed.push(device.clone());
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::LabelClear { devices: failed })
        }
    }

    // =========================================================================
    // Liveness
    // =========================================================================

    /// Block until the engine answers a plain `status`
    pub async fn wait_for_engine(&self, interval: Duration, shutdown: &CancellationToken) -> Result<()> {
        let args = builder::liveness();
        loop {
            match execute(self.runner.as_ref(), &self.tool, &args).await {
                Ok(output) if output.success => {
                    info!("Pool engine is responding");
                    return Ok(());
                }
                Ok(output) => {
                    warn!(output = %output.combined_str().trim(), "Pool engine status failed, waiting for it to start");
                }
                Err(e) => {
                    warn!(error = %e, "Pool engine status failed, waiting for it to start");
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => {
                    return Err(Error::EngineUnavailable("shutdown while waiting for pool engine".into()));
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Poll the engine until it is lost or shutdown is requested.
    ///
    /// Returns [`Error::EngineLost`] when the query fails, or when the engine
    /// reports no pools after the initial import completed.
    pub async fn watch_engine(&self, interval: Duration, shutdown: &CancellationToken) -> Result<()> {
        let args = builder::liveness();
        loop {
            let output = execute(self.runner.as_ref(), &self.tool, &args)
                .await
                .map_err(|e| Error::EngineLost(e.to_string()))?;
            if !output.success {
                let out = output.combined_str();
                error!(output = %out.trim(), "Pool engine status returned error in health check");
                return Err(Error::EngineLost(out.trim().to_string()));
            }
            if self.gate.is_imported() && output.combined_str().contains(parser::NO_POOLS_AVAILABLE) {
                return Err(Error::EngineLost(
                    "pools disappeared after the initial import".into(),
                ));
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{DeviceGroup, Topology};
    use crate::engine::fake::{fail, ok, FakeRunner};
    use assert_matches::assert_matches;

    fn spec(uid: &str, devices: &[&str]) -> PoolSpecification {
        PoolSpecification {
            uid: uid.into(),
            name: format!("pool-{}", uid),
            groups: vec![DeviceGroup {
                topology: Topology::Striped,
                devices: devices.iter().map(|d| d.to_string()).collect(),
            }],
            cache_file: String::new(),
            read_only: false,
            ro_threshold_percent: 85,
        }
    }

    fn engine(fake: &FakeRunner) -> PoolEngine {
        PoolEngine::new(Arc::new(fake.clone()), Arc::new(PoolEngineGate::new()), "zpool")
    }

    #[tokio::test]
    async fn test_delete_missing_pool_succeeds() {
        let fake = FakeRunner::new();
        fake.on("destroy", fail("cannot open 'cstor-1': no such pool\n"));
        engine(&fake).delete("cstor-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_failure() {
        let fake = FakeRunner::new();
        fake.on("destroy", fail("pool is busy"));
        let err = engine(&fake).delete("cstor-1").await.unwrap_err();
        assert_matches!(err, Error::CommandFailed { .. });
        assert_eq!(err.command_output(), Some("pool is busy"));
    }

    #[tokio::test]
    async fn test_create_when_already_imported_is_noop() {
        let fake = FakeRunner::new();
        fake.on("get -Hp name", ok("cstor-other\ncstor-1\n"));

        let outcome = engine(&fake).create(&spec("1", &["/dev/sdb"])).await.unwrap();
        assert_eq!(outcome, CreateOutcome::AlreadyImported);
        assert_eq!(fake.lines(), vec!["get -Hp name -o name"]);
        assert_eq!(fake.count("labelclear"), 0);
        assert_eq!(fake.count("create"), 0);
        assert_eq!(fake.count("import"), 0);
    }

    #[tokio::test]
    async fn test_create_full_sequence() {
        let fake = FakeRunner::new();
        fake.on("get -Hp name", ok(""));
        fake.on("import", fail("no pools available to import"));

        let outcome = engine(&fake)
            .create(&spec("1", &["/var/openebs/sparse/0.img", "/var/openebs/sparse/1.img"]))
            .await
            .unwrap();
        assert_eq!(outcome, CreateOutcome::Created);
        assert_eq!(
            fake.lines(),
            vec![
                "get -Hp name -o name",
                "import -o cachefile= -d /var/openebs/sparse",
                "labelclear /var/openebs/sparse/0.img",
                "labelclear /var/openebs/sparse/1.img",
                "create -O io.openebs:poolname=pool-1 cstor-1 /var/openebs/sparse/0.img /var/openebs/sparse/1.img",
            ]
        );
    }

    #[tokio::test]
    async fn test_create_rejects_existing_unimported_pool() {
        let fake = FakeRunner::new();
        fake.on("get -Hp name", ok(""));
        fake.on("import", ok("   pool: cstor-1\n     id: 1234\n  state: ONLINE\n"));

        let err = engine(&fake).create(&spec("1", &["/dev/sdb"])).await.unwrap_err();
        assert_matches!(err, Error::PoolExistsNotImported { .. });
        assert!(!err.is_retryable());
        assert_eq!(fake.count("labelclear"), 0);
        assert_eq!(fake.count("create"), 0);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_spec_before_any_command() {
        let fake = FakeRunner::new();
        let mut spec = spec("1", &["d1", "d2", "d3"]);
        spec.groups[0].topology = Topology::Mirrored;

        let err = engine(&fake).create(&spec).await.unwrap_err();
        assert_matches!(err, Error::InvalidSpec(_));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_continues_after_label_clear_failure() {
        let fake = FakeRunner::new();
        fake.on("get -Hp name", ok(""));
        fake.on("import", fail(""));
        fake.on("labelclear d1", fail("failed to open d1"));

        let outcome = engine(&fake).create(&spec("1", &["d1", "d2"])).await.unwrap();
        assert_eq!(outcome, CreateOutcome::Created);
        assert_eq!(fake.count("create"), 1);
    }

    #[tokio::test]
    async fn test_create_propagates_list_failure() {
        let fake = FakeRunner::new();
        fake.on("get -Hp name", fail("engine busy"));

        let err = engine(&fake).create(&spec("1", &["d1"])).await.unwrap_err();
        assert_matches!(err, Error::CommandFailed { .. });
        assert_eq!(fake.count("create"), 0);
    }

    #[tokio::test]
    async fn test_label_clear_attempts_every_device() {
        let fake = FakeRunner::new();
        fake.on("labelclear d1", fail("busy"));
        fake.on("labelclear d3", fail("busy"));

        let devices: Vec<String> = ["d1", "d2", "d3"].iter().map(|d| d.to_string()).collect();
        let err = engine(&fake).label_clear(&devices).await.unwrap_err();
        assert_matches!(err, Error::LabelClear { devices } => {
            assert_eq!(devices, vec!["d1", "d3"]);
        });
        assert_eq!(fake.count("labelclear"), 3);
    }

    #[tokio::test]
    async fn test_import_confirms_with_status() {
        let fake = FakeRunner::new();
        let mut spec = spec("1", &["d1"]);
        spec.cache_file = "/tmp/pool1.cache".into();

        engine(&fake)
            .import(&spec, &ImportOptions::with_cachefile())
            .await
            .unwrap();
        assert_eq!(
            fake.lines(),
            vec![
                "import -c /tmp/pool1.cache -o cachefile=/tmp/pool1.cache cstor-1",
                "status cstor-1",
            ]
        );
    }

    #[tokio::test]
    async fn test_import_failures() {
        let fake = FakeRunner::new();
        fake.on("import", fail("cannot import 'cstor-1': no such pool available"));
        let err = engine(&fake)
            .import(&spec("1", &["d1"]), &ImportOptions::with_cachefile())
            .await
            .unwrap_err();
        assert_matches!(err, Error::ImportFailed { .. });
        assert_eq!(fake.count("status"), 0);

        let fake = FakeRunner::new();
        fake.on("status", fail("cannot open 'cstor-1'"));
        let err = engine(&fake)
            .import(&spec("1", &["d1"]), &ImportOptions::with_cachefile())
            .await
            .unwrap_err();
        assert_matches!(err, Error::ImportConfirmation { .. });
    }

    #[tokio::test]
    async fn test_imported_pool_names() {
        let fake = FakeRunner::new();
        fake.on("get -Hp name", ok(""));
        assert!(engine(&fake).imported_pool_names().await.unwrap().is_empty());

        let fake = FakeRunner::new();
        fake.on("get -Hp name", fail("no engine"));
        assert!(engine(&fake).imported_pool_names().await.is_err());
    }

    #[tokio::test]
    async fn test_status_and_capacity() {
        let fake = FakeRunner::new();
        fake.on("get -Hp -ovalue", ok("DEGRADED\non\n"));
        fake.on(
            "get size,free,allocated",
            ok("NAME PROPERTY VALUE SOURCE\ncstor-1 size 10G -\ncstor-1 free 1G -\ncstor-1 allocated 9G -\n"),
        );
        let engine = engine(&fake);

        assert_eq!(engine.status("cstor-1").await.unwrap(), (PoolHealth::Degraded, true));
        let capacity = engine.capacity("cstor-1").await.unwrap();
        assert_eq!(capacity.used, "9G");
        assert_eq!(capacity.total, "10G");
    }

    #[tokio::test]
    async fn test_capacity_missing_field_is_an_error() {
        let fake = FakeRunner::new();
        fake.on(
            "get size,free,allocated",
            ok("NAME PROPERTY VALUE SOURCE\ncstor-1 size 10G -\ncstor-1 free 1G -\ncstor-1 allocated\n"),
        );
        let err = engine(&fake).capacity("cstor-1").await.unwrap_err();
        assert_matches!(err, Error::MissingCapacityField { ref field, .. } if field == "used");
        assert!(err.is_contract_violation());
    }

    #[tokio::test]
    async fn test_status_malformed_output() {
        let fake = FakeRunner::new();
        fake.on("get -Hp -ovalue", ok("ONLINE\n"));
        assert_matches!(
            engine(&fake).status("cstor-1").await,
            Err(Error::MalformedOutput { .. })
        );
    }

    #[tokio::test]
    async fn test_concurrent_creates_do_not_interleave() {
        let fake = FakeRunner::new();
        fake.on("get -Hp name", ok(""));
        fake.on("import", fail(""));
        fake.delay("labelclear", Duration::from_millis(30));
        fake.delay("create", Duration::from_millis(30));

        let engine = engine(&fake);
        let a = spec("a", &["/mnt/a/d1", "/mnt/a/d2"]);
        let b = spec("b", &["/mnt/b/d1", "/mnt/b/d2"]);

        let (ra, rb) = tokio::join!(engine.create(&a), engine.create(&b));
        assert_eq!(ra.unwrap(), CreateOutcome::Created);
        assert_eq!(rb.unwrap(), CreateOutcome::Created);

        let mut calls = fake.calls();
        calls.sort_by_key(|c| c.started);
        assert_eq!(calls.len(), 10);

        // Each sequence of five commands must finish before the next starts.
        let (first, second) = calls.split_at(5);
        let first_end = first.iter().map(|c| c.finished).max().unwrap();
        let second_start = second.iter().map(|c| c.started).min().unwrap();
        assert!(first_end < second_start);

        assert_eq!(first[4].verb(), "create");
        assert_eq!(second[4].verb(), "create");
        let first_pool = &first[4].args[3];
        let second_pool = &second[4].args[3];
        assert_ne!(first_pool, second_pool);

        let first_dir = if first_pool == "cstor-a" { "/mnt/a" } else { "/mnt/b" };
        assert!(first
            .iter()
            .filter(|c| c.verb() == "import" || c.verb() == "labelclear")
            .all(|c| c.line().contains(first_dir)));
    }

    #[tokio::test]
    async fn test_wait_for_engine_retries() {
        let fake = FakeRunner::new();
        fake.on_times("status", fail("connection refused"), 2);

        let shutdown = CancellationToken::new();
        engine(&fake)
            .wait_for_engine(Duration::from_millis(1), &shutdown)
            .await
            .unwrap();
        assert_eq!(fake.count("status"), 3);
    }

    #[tokio::test]
    async fn test_watch_engine_lost_after_import() {
        let fake = FakeRunner::new();
        fake.on("status", ok("no pools available\n"));
        let engine = engine(&fake);
        let shutdown = CancellationToken::new();

        // Before the initial import the message is expected; keep polling.
        let before = tokio::time::timeout(
            Duration::from_millis(30),
            engine.watch_engine(Duration::from_millis(1), &shutdown),
        )
        .await;
        assert!(before.is_err());

        engine.gate().mark_imported();
        let err = engine
            .watch_engine(Duration::from_millis(1), &shutdown)
            .await
            .unwrap_err();
        assert_matches!(err, Error::EngineLost(_));
    }

    #[tokio::test]
    async fn test_watch_engine_query_error_is_fatal() {
        let fake = FakeRunner::new();
        fake.unavailable("status");
        let shutdown = CancellationToken::new();
        let err = engine(&fake)
            .watch_engine(Duration::from_millis(1), &shutdown)
            .await
            .unwrap_err();
        assert_matches!(err, Error::EngineLost(_));
    }

    #[tokio::test]
    async fn test_watch_engine_stops_on_shutdown() {
        let fake = FakeRunner::new();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        engine(&fake)
            .watch_engine(Duration::from_secs(60), &shutdown)
            .await
            .unwrap();
    }
}
