//! CStorPool CRD
//!
//! Represents one ZFS-backed pool on a node, built from groups of block
//! devices arranged in a single redundancy topology.

use chrono::{DateTime, Utc};
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::ResourceCondition;
use crate::domain::types::{
    DeviceGroup, PoolCapacity, PoolHealth, PoolSpecification, Topology,
    DEFAULT_RO_THRESHOLD_PERCENT,
};
use crate::error::{Error, Result};

/// Finalizer keeping the resource around until its pool is destroyed
pub const POOL_FINALIZER: &str = "cstorpool.openebs.io/finalizer";

/// Annotation an operator sets to release a threshold read-only latch
pub const RELEASE_READ_ONLY_ANNOTATION: &str = "cstorpool.openebs.io/release-readonly";

// =============================================================================
// CStorPool CRD
// =============================================================================

/// CStorPool describes the desired layout of a pool and carries the observed
/// health and capacity in its status.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "CStorPool",
    plural = "cstorpools",
    shortname = "csp",
    status = "CStorPoolStatus",
    printcolumn = r#"{"name": "Type", "type": "string", "jsonPath": ".spec.poolSpec.poolType"}"#,
    printcolumn = r#"{"name": "Allocated", "type": "string", "jsonPath": ".status.capacity.used"}"#,
    printcolumn = r#"{"name": "Free", "type": "string", "jsonPath": ".status.capacity.free"}"#,
    printcolumn = r#"{"name": "ReadOnly", "type": "boolean", "jsonPath": ".status.readOnly"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct CStorPoolSpec {
    /// Block device groups making up the pool
    #[serde(default)]
    pub group: Vec<BlockDeviceGroup>,

    /// Pool attributes
    pub pool_spec: CStorPoolAttr,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// A group of block devices
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceGroup {
    #[serde(default)]
    pub block_device: Vec<CspBlockDevice>,
}

/// Block device reference
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CspBlockDevice {
    /// Name of the block device resource
    pub name: String,

    /// Stable device id (e.g. /dev/disk/by-id/...)
    pub device_id: String,

    #[serde(default)]
    pub in_use_by_pool: bool,
}

/// Pool attributes
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CStorPoolAttr {
    /// Cache file used for import
    #[serde(default)]
    pub cache_file: String,

    /// Redundancy arrangement
    pub pool_type: Topology,

    #[serde(default)]
    pub over_provisioning: bool,

    /// Used-capacity percentage at which the pool turns read-only
    #[serde(default = "default_ro_threshold")]
    pub ro_threshold_limit: u32,

    /// Administrative read-only intent
    #[serde(default)]
    pub read_only: bool,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the CStorPool
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CStorPoolStatus {
    /// Current phase
    #[serde(default)]
    pub phase: PoolPhase,

    /// Last observed capacity
    #[serde(default)]
    pub capacity: PoolCapacity,

    /// Whether the pool is read-only
    #[serde(default)]
    pub read_only: bool,

    /// Read-only was set by the capacity threshold
    #[serde(default)]
    pub threshold_latched: bool,

    /// Last status sync
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_update_time: Option<DateTime<Utc>>,

    /// First time the pool became available
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_available_time: Option<DateTime<Utc>>,

    /// Conditions
    #[serde(default)]
    pub conditions: Vec<ResourceCondition>,
}

/// Pool lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PoolPhase {
    #[default]
    Pending,
    Importing,
    Creating,
    Available,
    Degraded,
    Offline,
    Error,
    Destroying,
    Terminated,
}

impl PoolPhase {
    /// Phase reported for an observed pool health
    pub fn from_health(health: PoolHealth) -> Self {
        match health {
            PoolHealth::Online => PoolPhase::Available,
            PoolHealth::Degraded => PoolPhase::Degraded,
            PoolHealth::Offline => PoolPhase::Offline,
            PoolHealth::Error => PoolPhase::Error,
        }
    }
}

impl std::fmt::Display for PoolPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolPhase::Pending => write!(f, "Pending"),
            PoolPhase::Importing => write!(f, "Importing"),
            PoolPhase::Creating => write!(f, "Creating"),
            PoolPhase::Available => write!(f, "Available"),
            PoolPhase::Degraded => write!(f, "Degraded"),
            PoolPhase::Offline => write!(f, "Offline"),
            PoolPhase::Error => write!(f, "Error"),
            PoolPhase::Destroying => write!(f, "Destroying"),
            PoolPhase::Terminated => write!(f, "Terminated"),
        }
    }
}

// =============================================================================
// Default Value Functions
// =============================================================================

fn default_ro_threshold() -> u32 {
    DEFAULT_RO_THRESHOLD_PERCENT
}

// =============================================================================
// Implementations
// =============================================================================

impl CStorPool {
    /// Get the resource name
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Get the resource UID
    pub fn uid(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or("")
    }

    /// Get the current phase
    pub fn phase(&self) -> PoolPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Whether the pool reached Available or Degraded at least once
    pub fn has_been_available(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.last_available_time.is_some())
            .unwrap_or(false)
    }

    /// Whether deletion was requested
    pub fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    /// Whether the operator asked to release a threshold read-only latch
    pub fn release_requested(&self) -> bool {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(RELEASE_READ_ONLY_ANNOTATION))
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    /// All device ids in the pool
    pub fn device_ids(&self) -> Vec<String> {
        self.spec
            .group
            .iter()
            .flat_map(|g| g.block_device.iter().map(|bd| bd.device_id.clone()))
            .collect()
    }

    /// Build the pool specification. Fails when the resource has no UID or
    /// no devices; topology multiples are checked by
    /// [`PoolSpecification::validate`].
    pub fn to_specification(&self) -> Result<PoolSpecification> {
        let uid = self.uid();
        if uid.is_empty() {
            return Err(Error::InvalidSpec(format!(
                "Poolname/UID cannot be empty on {}",
                self.name()
            )));
        }
        let groups: Vec<DeviceGroup> = self
            .spec
            .group
            .iter()
            .filter(|g| !g.block_device.is_empty())
            .map(|g| DeviceGroup {
                topology: self.spec.pool_spec.pool_type,
                devices: g.block_device.iter().map(|bd| bd.device_id.clone()).collect(),
            })
            .collect();
        if groups.is_empty() {
            return Err(Error::InvalidSpec(format!(
                "No device IDs found on the csp {}",
                self.name()
            )));
        }
        Ok(PoolSpecification {
            uid: uid.to_string(),
            name: self.name().to_string(),
            groups,
            cache_file: self.spec.pool_spec.cache_file.clone(),
            read_only: self.spec.pool_spec.read_only,
            ro_threshold_percent: self.spec.pool_spec.ro_threshold_limit,
        })
    }
}

impl CStorPoolStatus {
    /// Record the observed health, flipping the phase accordingly
    pub fn observe_health(&mut self, health: PoolHealth) {
        self.phase = PoolPhase::from_health(health);
        if health.is_usable() && self.last_available_time.is_none() {
            self.last_available_time = Some(Utc::now());
        }
    }
}
