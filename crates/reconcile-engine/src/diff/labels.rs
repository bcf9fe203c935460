//! Label, annotation and taint diff per shared pool

use fleet_model::{ClusterInfo, NodePool, PoolMetadataPatch, Taint};
use std::collections::{BTreeMap, BTreeSet};

/// Changes turning the metadata of `old` into that of `desired`. Taints are
/// compared as whole (key, value, effect) tuples.
pub fn metadata_patch(old: &NodePool, desired: &NodePool) -> PoolMetadataPatch {
    let (labels_added, labels_deleted) = map_changes(&old.labels, &desired.labels);
    let (annotations_added, annotations_deleted) = map_changes(&old.annotations, &desired.annotations);

    let old_taints: BTreeSet<&Taint> = old.taints.iter().collect();
    let desired_taints: BTreeSet<&Taint> = desired.taints.iter().collect();

    PoolMetadataPatch {
        labels_added,
        labels_deleted,
        annotations_added,
        annotations_deleted,
        taints_added: desired_taints.difference(&old_taints).map(|t| (*t).clone()).collect(),
        taints_deleted: old_taints.difference(&desired_taints).map(|t| (*t).clone()).collect(),
    }
}

fn map_changes(
    old: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
) -> (BTreeMap<String, String>, Vec<String>) {
    let added = desired
        .iter()
        .filter(|(k, v)| old.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let deleted = old.keys().filter(|k| !desired.contains_key(*k)).cloned().collect();
    (added, deleted)
}

/// Non-empty patches for pools present in both snapshots.
pub fn labels_taints_annotations_diff(current: &ClusterInfo, desired: &ClusterInfo) -> BTreeMap<String, PoolMetadataPatch> {
    current
        .node_pools
        .iter()
        .filter_map(|old| {
            let new = desired.pool(&old.name)?;
            let patch = metadata_patch(old, new);
            (!patch.is_empty()).then(|| (old.name.clone(), patch))
        })
        .collect()
}
