//! Fixtures shared by unit tests

use std::collections::BTreeMap;

use kube::api::ObjectMeta;

use crate::crd::{
    BlockDeviceGroup, CStorPool, CStorPoolAttr, CStorPoolSpec, CStorVolumeReplica,
    CStorVolumeReplicaSpec, CspBlockDevice, POOL_UID_LABEL, VOLUME_NAME_LABEL,
};
use crate::domain::types::Topology;

/// Pool resource `pool-a` with the given UID and devices in one group
pub(crate) fn pool_resource(uid: &str, topology: Topology, devices: &[&str]) -> CStorPool {
    let block_device = devices
        .iter()
        .enumerate()
        .map(|(i, device)| CspBlockDevice {
            name: format!("bd-{}", i),
            device_id: device.to_string(),
            in_use_by_pool: false,
        })
        .collect();

    CStorPool {
        metadata: ObjectMeta {
            name: Some("pool-a".into()),
            uid: Some(uid.into()),
            generation: Some(1),
            ..Default::default()
        },
        spec: CStorPoolSpec {
            group: vec![BlockDeviceGroup { block_device }],
            pool_spec: CStorPoolAttr {
                cache_file: "/tmp/pool1.cache".into(),
                pool_type: topology,
                over_provisioning: false,
                ro_threshold_limit: 85,
                read_only: false,
            },
        },
        status: None,
    }
}

/// Replica resource labelled with its pool UID and volume name
pub(crate) fn replica_resource(
    namespace: &str,
    name: &str,
    pool_uid: &str,
    volume: &str,
) -> CStorVolumeReplica {
    let labels: BTreeMap<String, String> = [
        (POOL_UID_LABEL.to_string(), pool_uid.to_string()),
        (VOLUME_NAME_LABEL.to_string(), volume.to_string()),
    ]
    .into_iter()
    .collect();

    CStorVolumeReplica {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            uid: Some(format!("{}-uid", name)),
            generation: Some(1),
            labels: Some(labels),
            ..Default::default()
        },
        spec: CStorVolumeReplicaSpec {
            target_ip: "10.0.0.7".into(),
            capacity: "5G".into(),
            block_size: 4096,
            replica_id: None,
        },
        status: None,
    }
}
