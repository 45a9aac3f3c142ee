//! Domain Types - pool and replica specifications, observed status, and the
//! typed work items that flow from the informers to the reconcilers.

use crate::error::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// =============================================================================
// Constants
// =============================================================================

/// Prefix of every pool name derived from a resource UID
pub const POOL_PREFIX: &str = "cstor-";

/// Default used-capacity percentage above which a pool is made read-only
pub const DEFAULT_RO_THRESHOLD_PERCENT: u32 = 85;

/// Derive the pool name from the owning resource UID
pub fn pool_name(uid: &str) -> String {
    format!("{}{}", POOL_PREFIX, uid)
}

// =============================================================================
// Topology
// =============================================================================

/// Device redundancy arrangement of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    Striped,
    Mirrored,
    Raidz,
    Raidz2,
}

impl Topology {
    /// Minimum number of devices in one redundancy group
    pub fn group_size(&self) -> usize {
        match self {
            Topology::Striped => 1,
            Topology::Mirrored => 2,
            Topology::Raidz => 3,
            Topology::Raidz2 => 6,
        }
    }

    /// Keyword the pool tool expects before each group, if any
    pub fn keyword(&self) -> Option<&'static str> {
        match self {
            Topology::Striped => None,
            Topology::Mirrored => Some("mirror"),
            Topology::Raidz => Some("raidz"),
            Topology::Raidz2 => Some("raidz2"),
        }
    }
}

impl std::fmt::Display for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topology::Striped => write!(f, "striped"),
            Topology::Mirrored => write!(f, "mirrored"),
            Topology::Raidz => write!(f, "raidz"),
            Topology::Raidz2 => write!(f, "raidz2"),
        }
    }
}

impl FromStr for Topology {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "striped" => Ok(Topology::Striped),
            "mirrored" => Ok(Topology::Mirrored),
            "raidz" => Ok(Topology::Raidz),
            "raidz2" => Ok(Topology::Raidz2),
            other => Err(Error::InvalidSpec(format!("unknown pool type {:?}", other))),
        }
    }
}

// =============================================================================
// Pool Specification
// =============================================================================

/// A group of devices sharing one redundancy arrangement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGroup {
    pub topology: Topology,
    pub devices: Vec<String>,
}

/// Desired state of a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpecification {
    /// UID of the owning resource
    pub uid: String,
    /// Human name of the owning resource
    pub name: String,
    pub groups: Vec<DeviceGroup>,
    pub cache_file: String,
    pub read_only: bool,
    pub ro_threshold_percent: u32,
}

impl PoolSpecification {
    /// Name of the pool as known to the pool tool
    pub fn pool_name(&self) -> String {
        pool_name(&self.uid)
    }

    /// All device ids in declaration order
    pub fn device_ids(&self) -> Vec<String> {
        self.groups
            .iter()
            .flat_map(|g| g.devices.iter().cloned())
            .collect()
    }

    /// Reject specifications that would produce an invalid create command.
    ///
    /// Each group must hold a non-zero exact multiple of its topology's
    /// group size.
    pub fn validate(&self) -> Result<()> {
        if self.uid.trim().is_empty() {
            return Err(Error::InvalidSpec("pool UID cannot be empty".into()));
        }
        if self.groups.is_empty() {
            return Err(Error::InvalidSpec(format!(
                "no device groups found on pool {}",
                self.name
            )));
        }
        for group in &self.groups {
            let expected = group.topology.group_size();
            let count = group.devices.len();
            if count < expected {
                return Err(Error::InvalidSpec(format!(
                    "expected {{{}}} blockdevices got {{{}}}, for pool type {{{}}}",
                    expected, count, group.topology
                )));
            }
            if count % expected != 0 {
                return Err(Error::InvalidSpec(format!(
                    "expected multiples of {{{}}} blockdevices required got {{{}}}, for pool type {{{}}}",
                    expected, count, group.topology
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Runtime Status
// =============================================================================

/// Health as reported on the pool resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum PoolHealth {
    Online,
    Degraded,
    Offline,
    #[default]
    Error,
}

impl PoolHealth {
    /// Whether replicas may be placed on a pool in this state
    pub fn is_usable(&self) -> bool {
        matches!(self, PoolHealth::Online | PoolHealth::Degraded)
    }
}

impl std::fmt::Display for PoolHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolHealth::Online => write!(f, "Online"),
            PoolHealth::Degraded => write!(f, "Degraded"),
            PoolHealth::Offline => write!(f, "Offline"),
            PoolHealth::Error => write!(f, "Error"),
        }
    }
}

/// Capacity triple as printed by the pool tool (e.g. "9.94G")
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PoolCapacity {
    pub total: String,
    pub free: String,
    pub used: String,
}

impl PoolCapacity {
    /// Used space as a percentage of total, when both sizes parse
    pub fn used_percent(&self) -> Option<f64> {
        let total = parse_size(&self.total)?;
        let used = parse_size(&self.used)?;
        if total == 0 {
            return None;
        }
        Some(used as f64 * 100.0 / total as f64)
    }
}

/// Observed state of a pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolRuntimeStatus {
    pub health: PoolHealth,
    pub read_only: bool,
    pub capacity: PoolCapacity,
}

/// Parse a byte size as printed by the pool tool ("202K", "9.94G", "512").
///
/// Units are binary multiples; a trailing "B" or "iB" is tolerated.
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() || s == "-" {
        return None;
    }
    let s = s.trim_end_matches("iB").trim_end_matches('B');
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number.parse().ok()?;
    let shift = match unit {
        "" => 0,
        "K" | "k" => 10,
        "M" => 20,
        "G" => 30,
        "T" => 40,
        "P" => 50,
        "E" => 60,
        _ => return None,
    };
    Some((value * (1u64 << shift) as f64) as u64)
}

// =============================================================================
// Import Options
// =============================================================================

/// Options controlling how the import command is built
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Import using the pool's cache file
    pub cachefile_flag: bool,
    /// Directory where pool devices reside
    pub dev_path: Option<String>,
    /// Build the command without the pool name so it only reports pools
    pub dont_import: bool,
}

impl ImportOptions {
    pub fn with_cachefile() -> Self {
        Self {
            cachefile_flag: true,
            ..Default::default()
        }
    }

    /// Existence probe: lists importable pools without importing anything
    pub fn probe(dev_path: Option<String>) -> Self {
        Self {
            cachefile_flag: false,
            dev_path,
            dont_import: true,
        }
    }
}

// =============================================================================
// Work Items
// =============================================================================

/// Identity of a watched resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Build the key of a resource from its metadata
    pub fn from_resource<K: kube::Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl FromStr for ResourceKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let key = match s.split_once('/') {
            Some((ns, name)) => Self::namespaced(ns, name),
            None => Self::cluster(s),
        };
        if key.name.is_empty() || key.namespace.as_deref() == Some("") {
            return Err(Error::Internal(format!("invalid resource key {:?}", s)));
        }
        Ok(key)
    }
}

/// Operation requested for a queued resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueOperation {
    Add,
    Modify,
    Destroy,
    Sync,
}

impl QueueOperation {
    /// Rank used when two operations for one resource are pending together.
    /// Destroy outranks everything; Sync is implied by every other operation.
    fn precedence(self) -> u8 {
        match self {
            QueueOperation::Sync => 0,
            QueueOperation::Modify => 1,
            QueueOperation::Add => 2,
            QueueOperation::Destroy => 3,
        }
    }
}

impl std::fmt::Display for QueueOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueOperation::Add => write!(f, "add"),
            QueueOperation::Modify => write!(f, "modify"),
            QueueOperation::Destroy => write!(f, "destroy"),
            QueueOperation::Sync => write!(f, "sync"),
        }
    }
}

/// Payload of the reconciler work queues
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueuedWorkItem {
    pub key: ResourceKey,
    pub operation: QueueOperation,
}

impl QueuedWorkItem {
    pub fn new(key: ResourceKey, operation: QueueOperation) -> Self {
        Self { key, operation }
    }

    /// Fold a newer request for the same resource into this pending one
    pub fn merge(self, newer: Self) -> Self {
        if newer.operation.precedence() > self.operation.precedence() {
            newer
        } else {
            self
        }
    }
}

impl std::fmt::Display for QueuedWorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.key, self.operation)
    }
}

// =============================================================================
// Volume Replicas
// =============================================================================

/// Desired state of a volume replica hosted in a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeReplicaSpecification {
    /// Name of the replica resource
    pub name: String,
    /// UID of the owning pool resource
    pub pool_uid: String,
    /// Name of the logical volume
    pub volume_name: String,
    pub target_ip: String,
    pub capacity: String,
    pub block_size: u32,
    pub replica_id: Option<String>,
}

impl VolumeReplicaSpecification {
    /// Name of the pool hosting this replica
    pub fn pool_name(&self) -> String {
        pool_name(&self.pool_uid)
    }

    /// Dataset name: `<pool>/<volume>`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.pool_name(), self.volume_name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_uid.is_empty() {
            return Err(Error::InvalidSpec(format!(
                "replica {} has no owning pool",
                self.name
            )));
        }
        if self.volume_name.is_empty() {
            return Err(Error::InvalidSpec(format!(
                "replica {} has no volume name",
                self.name
            )));
        }
        if self.capacity.trim().is_empty() {
            return Err(Error::InvalidSpec(format!(
                "replica {} has no capacity",
                self.name
            )));
        }
        Ok(())
    }
}

/// Health of a replica as reported by the dataset tool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ReplicaHealth {
    Healthy,
    Degraded,
    Offline,
    #[default]
    Error,
}

impl std::fmt::Display for ReplicaHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaHealth::Healthy => write!(f, "Healthy"),
            ReplicaHealth::Degraded => write!(f, "Degraded"),
            ReplicaHealth::Offline => write!(f, "Offline"),
            ReplicaHealth::Error => write!(f, "Error"),
        }
    }
}

/// Space consumed by a replica
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaCapacity {
    pub used: String,
    pub logical_used: String,
}
