//! Argument builders for the pool and dataset tools
//!
//! Every flag value is its own argv entry (`-o`, `cachefile=<path>`), never a
//! single string with an embedded space. The tools parse options with getopt
//! and would otherwise read the path as the pool name.

use crate::domain::types::{ImportOptions, PoolSpecification, VolumeReplicaSpecification};

/// Property holding the owning resource name on the pool
pub const POOLNAME_PROPERTY: &str = "io.openebs:poolname";

/// Property holding the read-only state of the pool
pub const READONLY_PROPERTY: &str = "io.openebs:readonly";

/// Property holding the iSCSI target of a replica
pub const TARGET_IP_PROPERTY: &str = "io.openebs:targetip";

/// Property holding the replica id of a zvol
pub const REPLICA_ID_PROPERTY: &str = "io.openebs:zvol_replica_id";

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

// =============================================================================
// Pool Commands
// =============================================================================

/// `import [-c <cache>] -o cachefile=<cache> [-d <dir>] [cstor-<uid>]`
///
/// A device path takes precedence over the cache file flag.
pub fn import(spec: &PoolSpecification, options: &ImportOptions) -> Vec<String> {
    let dev_path = options.dev_path.as_deref().filter(|p| !p.is_empty());
    let cachefile_flag = dev_path.is_none() && options.cachefile_flag;

    let mut argv = vec!["import".to_string()];
    if cachefile_flag && !spec.cache_file.is_empty() {
        argv.push("-c".to_string());
        argv.push(spec.cache_file.clone());
    }

    argv.push("-o".to_string());
    argv.push(format!("cachefile={}", spec.cache_file));

    if let Some(dir) = dev_path {
        argv.push("-d".to_string());
        argv.push(dir.to_string());
    }

    if !options.dont_import {
        argv.push(spec.pool_name());
    }
    argv
}

/// `create [-o cachefile=<cache>] -O io.openebs:poolname=<name> cstor-<uid> <vdevs>`
///
/// Non-striped groups are split into chunks of the topology's group size,
/// each prefixed by the topology keyword. Callers validate first; a trailing
/// partial chunk is emitted as-is.
pub fn create(spec: &PoolSpecification) -> Vec<String> {
    let mut argv = vec!["create".to_string()];
    if !spec.cache_file.is_empty() {
        argv.push("-o".to_string());
        argv.push(format!("cachefile={}", spec.cache_file));
    }
    argv.push("-O".to_string());
    argv.push(format!("{}={}", POOLNAME_PROPERTY, spec.name));
    argv.push(spec.pool_name());

    for group in &spec.groups {
        match group.topology.keyword() {
            None => argv.extend(group.devices.iter().cloned()),
            Some(keyword) => {
                for chunk in group.devices.chunks(group.topology.group_size()) {
                    argv.push(keyword.to_string());
                    argv.extend(chunk.iter().cloned());
                }
            }
        }
    }
    argv
}

/// `get -Hp -ovalue health,io.openebs:readonly <pool>`
pub fn status(pool: &str) -> Vec<String> {
    let mut argv = args(["get", "-Hp", "-ovalue"]);
    argv.push(format!("health,{}", READONLY_PROPERTY));
    argv.push(pool.to_string());
    argv
}

/// `get size,free,allocated <pool>`
pub fn capacity(pool: &str) -> Vec<String> {
    args(["get", "size,free,allocated", pool])
}

/// `status <pool>`, used to confirm an import
pub fn pool_status(pool: &str) -> Vec<String> {
    args(["status", pool])
}

/// `labelclear <device>`
pub fn label_clear(device: &str) -> Vec<String> {
    args(["labelclear", device])
}

/// `set io.openebs:readonly=on|off <pool>`
pub fn set_read_only(pool: &str, read_only: bool) -> Vec<String> {
    let value = if read_only { "on" } else { "off" };
    vec![
        "set".to_string(),
        format!("{}={}", READONLY_PROPERTY, value),
        pool.to_string(),
    ]
}

/// `set cachefile=<cache> <pool>`
pub fn set_cachefile(spec: &PoolSpecification) -> Vec<String> {
    vec![
        "set".to_string(),
        format!("cachefile={}", spec.cache_file),
        spec.pool_name(),
    ]
}

/// `get -Hp name -o name`
pub fn list_names() -> Vec<String> {
    args(["get", "-Hp", "name", "-o", "name"])
}

/// `destroy <pool>`
pub fn destroy(pool: &str) -> Vec<String> {
    args(["destroy", pool])
}

/// `status`, the engine liveness probe
pub fn liveness() -> Vec<String> {
    args(["status"])
}

/// Directory holding a device that does not live under `/dev`.
///
/// File-backed (sparse) devices are not found by a default import scan, so
/// the probe points the tool at their directory.
pub fn dev_path_if_not_slash_dev(device_id: &str) -> Option<String> {
    if device_id.is_empty() || device_id.starts_with("/dev") {
        return None;
    }
    device_id
        .rfind('/')
        .map(|idx| device_id[..idx].to_string())
}

// =============================================================================
// Dataset Commands
// =============================================================================

/// `create -b <bs> -s -o io.openebs:targetip=<ip> [-o io.openebs:zvol_replica_id=<id>] -V <size> <pool>/<vol>`
pub fn replica_create(spec: &VolumeReplicaSpecification) -> Vec<String> {
    let mut argv = vec![
        "create".to_string(),
        "-b".to_string(),
        spec.block_size.to_string(),
        "-s".to_string(),
        "-o".to_string(),
        format!("{}={}", TARGET_IP_PROPERTY, spec.target_ip),
    ];
    if let Some(id) = spec.replica_id.as_deref().filter(|id| !id.is_empty()) {
        argv.push("-o".to_string());
        argv.push(format!("{}={}", REPLICA_ID_PROPERTY, id));
    }
    argv.push("-V".to_string());
    argv.push(spec.capacity.clone());
    argv.push(spec.full_name());
    argv
}

/// `destroy -R <pool>/<vol>`
pub fn replica_destroy(dataset: &str) -> Vec<String> {
    args(["destroy", "-R", dataset])
}

/// `list -Hp -t volume -o name`
pub fn replica_list() -> Vec<String> {
    args(["list", "-Hp", "-t", "volume", "-o", "name"])
}

/// `stats <pool>/<vol>`
pub fn replica_stats(dataset: &str) -> Vec<String> {
    args(["stats", dataset])
}

/// `get -Hp -ovalue used,logicalused <pool>/<vol>`
pub fn replica_capacity(dataset: &str) -> Vec<String> {
    args(["get", "-Hp", "-ovalue", "used,logicalused", dataset])
}
