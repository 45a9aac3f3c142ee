//! CStorVolumeReplica CRD
//!
//! Represents one replica of a logical volume, stored as a dataset inside a
//! cStor pool on this node.

use chrono::{DateTime, Utc};
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::ResourceCondition;
use crate::domain::types::{ReplicaCapacity, ReplicaHealth, VolumeReplicaSpecification};
use crate::error::{Error, Result};

/// Label carrying the UID of the owning pool resource
pub const POOL_UID_LABEL: &str = "cstorpool.openebs.io/uid";

/// Label carrying the name of the logical volume
pub const VOLUME_NAME_LABEL: &str = "cstorvolume.openebs.io/name";

/// Finalizer keeping the resource around until its dataset is destroyed
pub const REPLICA_FINALIZER: &str = "cstorvolumereplica.openebs.io/finalizer";

// =============================================================================
// CStorVolumeReplica CRD
// =============================================================================

/// CStorVolumeReplica describes a replica dataset and carries its observed
/// health and space usage.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "CStorVolumeReplica",
    plural = "cstorvolumereplicas",
    shortname = "cvr",
    status = "CStorVolumeReplicaStatus",
    namespaced,
    printcolumn = r#"{"name": "Used", "type": "string", "jsonPath": ".status.capacity.used"}"#,
    printcolumn = r#"{"name": "Allocated", "type": "string", "jsonPath": ".status.capacity.logicalUsed"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CStorVolumeReplicaSpec {
    /// IP of the iSCSI target serving the volume
    #[serde(rename = "targetIP")]
    pub target_ip: String,

    /// Volume size (e.g. "5G")
    pub capacity: String,

    /// Block size of the zvol in bytes
    #[serde(default = "default_block_size")]
    pub block_size: u32,

    /// Replica identity within the volume
    #[serde(default, rename = "replicaid")]
    pub replica_id: Option<String>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the CStorVolumeReplica
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CStorVolumeReplicaStatus {
    #[serde(default)]
    pub phase: ReplicaPhase,

    #[serde(default)]
    pub capacity: ReplicaCapacity,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_update_time: Option<DateTime<Utc>>,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_available_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub conditions: Vec<ResourceCondition>,
}

/// Replica lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ReplicaPhase {
    #[default]
    Pending,
    Creating,
    Available,
    Degraded,
    Error,
    Destroying,
    Terminated,
}

impl ReplicaPhase {
    pub fn from_health(health: ReplicaHealth) -> Self {
        match health {
            ReplicaHealth::Healthy => ReplicaPhase::Available,
            ReplicaHealth::Degraded => ReplicaPhase::Degraded,
            ReplicaHealth::Offline | ReplicaHealth::Error => ReplicaPhase::Error,
        }
    }
}

impl std::fmt::Display for ReplicaPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaPhase::Pending => write!(f, "Pending"),
            ReplicaPhase::Creating => write!(f, "Creating"),
            ReplicaPhase::Available => write!(f, "Available"),
            ReplicaPhase::Degraded => write!(f, "Degraded"),
            ReplicaPhase::Error => write!(f, "Error"),
            ReplicaPhase::Destroying => write!(f, "Destroying"),
            ReplicaPhase::Terminated => write!(f, "Terminated"),
        }
    }
}

fn default_block_size() -> u32 {
    4096
}

// =============================================================================
// Implementations
// =============================================================================

impl CStorVolumeReplica {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    pub fn phase(&self) -> ReplicaPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn has_been_available(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.last_available_time.is_some())
            .unwrap_or(false)
    }

    pub fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.meta()
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }

    /// UID of the owning pool resource, from labels
    pub fn pool_uid(&self) -> Option<&str> {
        self.label(POOL_UID_LABEL)
    }

    /// Build the replica specification from labels and spec
    pub fn to_specification(&self) -> Result<VolumeReplicaSpecification> {
        let pool_uid = self.pool_uid().unwrap_or_default().to_string();
        let volume_name = self.label(VOLUME_NAME_LABEL).unwrap_or_default().to_string();
        let spec = VolumeReplicaSpecification {
            name: self.name().to_string(),
            pool_uid,
            volume_name,
            target_ip: self.spec.target_ip.clone(),
            capacity: self.spec.capacity.clone(),
            block_size: self.spec.block_size,
            replica_id: self.spec.replica_id.clone(),
        };
        spec.validate()?;
        if spec.block_size == 0 || !spec.block_size.is_power_of_two() {
            return Err(Error::InvalidSpec(format!(
                "replica {} has invalid block size {}",
                spec.name, spec.block_size
            )));
        }
        Ok(spec)
    }
}

impl CStorVolumeReplicaStatus {
    pub fn observe_health(&mut self, health: ReplicaHealth) {
        self.phase = ReplicaPhase::from_health(health);
        if matches!(health, ReplicaHealth::Healthy | ReplicaHealth::Degraded)
            && self.last_available_time.is_none()
        {
            self.last_available_time = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::replica_resource;

    #[test]
    fn test_to_specification() {
        let cvr = replica_resource("openebs", "pvc-1-rep", "abcd", "pvc-1");
        let spec = cvr.to_specification().unwrap();
        assert_eq!(spec.full_name(), "cstor-abcd/pvc-1");
        assert_eq!(spec.block_size, 4096);
    }

    #[test]
    fn test_to_specification_requires_labels() {
        let mut cvr = replica_resource("openebs", "pvc-1-rep", "abcd", "pvc-1");
        cvr.metadata.labels = None;
        assert!(matches!(cvr.to_specification(), Err(Error::InvalidSpec(_))));
    }

    #[test]
    fn test_invalid_block_size() {
        let mut cvr = replica_resource("openebs", "pvc-1-rep", "abcd", "pvc-1");
        cvr.spec.block_size = 3000;
        assert!(matches!(cvr.to_specification(), Err(Error::InvalidSpec(_))));
    }

    #[test]
    fn test_phase_from_health() {
        assert_eq!(ReplicaPhase::from_health(ReplicaHealth::Healthy), ReplicaPhase::Available);
        assert_eq!(ReplicaPhase::from_health(ReplicaHealth::Offline), ReplicaPhase::Error);

        let mut status = CStorVolumeReplicaStatus::default();
        status.observe_health(ReplicaHealth::Error);
        assert!(status.last_available_time.is_none());
        status.observe_health(ReplicaHealth::Degraded);
        assert!(status.last_available_time.is_some());
    }
}
