//! Replica dataset commands against the dataset tool

use std::sync::Arc;

use tracing::{error, info};

use super::{builder, command_failed, execute, execute_checked, parser};
use crate::domain::ports::CommandRunnerRef;
use crate::domain::types::{ReplicaCapacity, ReplicaHealth, VolumeReplicaSpecification};
use crate::error::Result;
use crate::sync::PoolEngineGate;

/// Client for replica datasets. Shares the pool gate since both tools talk
/// to the same engine process.
#[derive(Clone)]
pub struct ReplicaEngine {
    runner: CommandRunnerRef,
    gate: Arc<PoolEngineGate>,
    tool: String,
}

impl ReplicaEngine {
    pub fn new(runner: CommandRunnerRef, gate: Arc<PoolEngineGate>, tool: impl Into<String>) -> Self {
        Self {
            runner,
            gate,
            tool: tool.into(),
        }
    }

    /// Create the replica dataset; an existing dataset counts as created
    pub async fn create(&self, spec: &VolumeReplicaSpecification) -> Result<()> {
        let dataset = spec.full_name();
        let _guard = self.gate.lock().await;

        let args = builder::replica_create(spec);
        let output = execute(self.runner.as_ref(), &self.tool, &args).await?;
        if output.success {
            info!(
                eventcode = "cstor.volume.replica.create.success",
                rname = %spec.name,
                dataset = %dataset,
                "Volume replica created successfully"
            );
            return Ok(());
        }
        if output.combined_str().contains(parser::DATASET_ALREADY_EXISTS) {
            info!(dataset = %dataset, "Volume replica already exists");
            return Ok(());
        }

        error!(
            eventcode = "cstor.volume.replica.create.failure",
            rname = %spec.name,
            dataset = %dataset,
            output = %output.combined_str().trim(),
            "Failed to create volume replica"
        );
        Err(command_failed(&self.tool, &args, &output))
    }

    /// Destroy the dataset and its snapshots; a missing dataset counts as
    /// destroyed
    pub async fn delete(&self, dataset: &str) -> Result<()> {
        let _guard = self.gate.lock().await;
        let args = builder::replica_destroy(dataset);
        let output = execute(self.runner.as_ref(), &self.tool, &args).await?;
        if output.success {
            info!(
                eventcode = "cstor.volume.replica.delete.success",
                dataset = %dataset,
                "Volume replica deleted successfully"
            );
            return Ok(());
        }
        if output.combined_str().contains(parser::DATASET_DOES_NOT_EXIST) {
            info!(dataset = %dataset, "Assuming volume replica deletion successful");
            return Ok(());
        }

        error!(
            eventcode = "cstor.volume.replica.delete.failure",
            dataset = %dataset,
            output = %output.combined_str().trim(),
            "Failed to delete volume replica"
        );
        Err(command_failed(&self.tool, &args, &output))
    }

    /// Names of every volume dataset on the node
    pub async fn list(&self) -> Result<Vec<String>> {
        let _guard = self.gate.lock().await;
        let args = builder::replica_list();
        let output = execute_checked(self.runner.as_ref(), &self.tool, &args).await?;
        Ok(parser::names(&output.stdout_str()))
    }

    pub async fn status(&self, dataset: &str) -> Result<ReplicaHealth> {
        let _guard = self.gate.lock().await;
        let args = builder::replica_stats(dataset);
        let output = execute_checked(self.runner.as_ref(), &self.tool, &args).await?;
        parser::replica_stats(dataset, &output.stdout_str())
    }

    pub async fn capacity(&self, dataset: &str) -> Result<ReplicaCapacity> {
        let _guard = self.gate.lock().await;
        let args = builder::replica_capacity(dataset);
        let output = execute_checked(self.runner.as_ref(), &self.tool, &args).await?;
        parser::replica_capacity(&output.stdout_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::{fail, ok, FakeRunner};
    use crate::error::Error;
    use assert_matches::assert_matches;

    fn engine(fake: &FakeRunner) -> ReplicaEngine {
        ReplicaEngine::new(Arc::new(fake.clone()), Arc::new(PoolEngineGate::new()), "zfs")
    }

    fn spec() -> VolumeReplicaSpecification {
        VolumeReplicaSpecification {
            name: "pvc-1-rep".into(),
            pool_uid: "abcd".into(),
            volume_name: "pvc-1".into(),
            target_ip: "10.0.0.7".into(),
            capacity: "5G".into(),
            block_size: 4096,
            replica_id: Some("R1".into()),
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let fake = FakeRunner::new();
        fake.on("create", fail("cannot create 'cstor-abcd/pvc-1': dataset already exists"));
        engine(&fake).create(&spec()).await.unwrap();
        assert_eq!(fake.calls()[0].tool, "zfs");
    }

    #[tokio::test]
    async fn test_create_failure() {
        let fake = FakeRunner::new();
        fake.on("create", fail("out of space"));
        assert_matches!(engine(&fake).create(&spec()).await, Err(Error::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_delete_missing_dataset_succeeds() {
        let fake = FakeRunner::new();
        fake.on("destroy", fail("cannot open 'cstor-abcd/pvc-1': dataset does not exist"));
        engine(&fake).delete("cstor-abcd/pvc-1").await.unwrap();
        assert_eq!(fake.lines(), vec!["destroy -R cstor-abcd/pvc-1"]);
    }

    #[tokio::test]
    async fn test_status_and_capacity() {
        let fake = FakeRunner::new();
        fake.on(
            "stats",
            ok(r#"{"stats":[{"name":"cstor-abcd/pvc-1","status":"Healthy"}]}"#),
        );
        fake.on("get -Hp -ovalue used,logicalused", ok("1.2M\n800K\n"));
        let engine = engine(&fake);

        assert_eq!(engine.status("cstor-abcd/pvc-1").await.unwrap(), ReplicaHealth::Healthy);
        let capacity = engine.capacity("cstor-abcd/pvc-1").await.unwrap();
        assert_eq!(capacity.used, "1.2M");
        assert_eq!(capacity.logical_used, "800K");
    }

    #[tokio::test]
    async fn test_list() {
        let fake = FakeRunner::new();
        fake.on("list", ok("cstor-abcd/pvc-1\ncstor-abcd/pvc-2\n"));
        assert_eq!(
            engine(&fake).list().await.unwrap(),
            vec!["cstor-abcd/pvc-1", "cstor-abcd/pvc-2"]
        );
    }
}
