//! Unit tests for the node-pool diff

use super::*;
use crate::projection::PoolNodes;
use std::collections::BTreeSet;

fn pools(entries: &[(&str, &[&str])]) -> PoolNodes {
    entries
        .iter()
        .map(|(pool, nodes)| (pool.to_string(), nodes.iter().map(|n| n.to_string()).collect()))
        .collect()
}

fn pairs(map: &PoolNodes) -> BTreeSet<(String, String)> {
    map.iter()
        .flat_map(|(p, nodes)| nodes.iter().map(move |n| (p.clone(), n.clone())))
        .collect()
}

/// Inputs covering empty pools, pools on one side only, overlapping and
/// disjoint node sets.
fn cases() -> Vec<(PoolNodes, PoolNodes)> {
    vec![
        (pools(&[]), pools(&[])),
        (pools(&[("p1", &["n1"])]), pools(&[])),
        (pools(&[]), pools(&[("p1", &["n1", "n2"])])),
        (pools(&[("p1", &["n1"]), ("p2", &["n4", "n5"])]), pools(&[("p1", &["n1", "n6"]), ("p2", &["n5"])])),
        (pools(&[("p1", &["a", "b"]), ("p3", &[])]), pools(&[("p1", &["c", "d"]), ("p4", &[])])),
        (pools(&[("p1", &["a"]), ("p2", &["b"])]), pools(&[("p2", &["b", "c"]), ("p3", &["d"])])),
        (pools(&[("autoscaled", &[])]), pools(&[("autoscaled", &["x1", "x2"])])),
    ]
}

#[test]
fn test_scenario_partial_changes() {
    let old = pools(&[("p1", &["n1"]), ("p2", &["n4", "n5"])]);
    let desired = pools(&[("p1", &["n1", "n6"]), ("p2", &["n5"])]);

    let diff = node_pools_diff(old, desired);
    assert!(diff.deleted.is_empty());
    assert!(diff.added.is_empty());
    assert_eq!(diff.partially_deleted, pools(&[("p2", &["n4"])]));
    assert_eq!(diff.partially_added, pools(&[("p1", &["n6"])]));
}

#[test]
fn test_identical_snapshots_yield_empty_buckets() {
    for (old, _) in cases() {
        let diff = node_pools_diff(old.clone(), old);
        assert!(diff.is_empty(), "{diff:?}");
    }
}

#[test]
fn test_buckets_partition_one_sided_pairs() {
    for (old, desired) in cases() {
        let diff = node_pools_diff(old.clone(), desired.clone());

        let buckets = [
            pairs(&diff.deleted),
            pairs(&diff.added),
            pairs(&diff.partially_deleted),
            pairs(&diff.partially_added),
        ];
        for i in 0..buckets.len() {
            for j in (i + 1)..buckets.len() {
                assert!(buckets[i].is_disjoint(&buckets[j]), "buckets {i} and {j} overlap");
            }
        }

        let old_pairs = pairs(&old);
        let desired_pairs = pairs(&desired);
        let one_sided: BTreeSet<_> = old_pairs.symmetric_difference(&desired_pairs).cloned().collect();
        let classified: BTreeSet<_> = buckets.iter().flatten().cloned().collect();
        assert_eq!(one_sided, classified);

        // whole-pool buckets keep empty pools too
        for name in old.keys().filter(|p| !desired.contains_key(*p)) {
            assert!(diff.deleted.contains_key(name));
        }
        for name in desired.keys().filter(|p| !old.contains_key(*p)) {
            assert!(diff.added.contains_key(name));
        }
    }
}

#[test]
fn test_applying_buckets_round_trips() {
    for (old, desired) in cases() {
        let diff = node_pools_diff(old.clone(), desired.clone());

        let mut grown = old.clone();
        for (pool, nodes) in diff.added.iter().chain(diff.partially_added.iter()) {
            grown.entry(pool.clone()).or_default().extend(nodes.iter().cloned());
        }
        let mut shrunk = desired.clone();
        for (pool, nodes) in diff.deleted.iter().chain(diff.partially_deleted.iter()) {
            shrunk.entry(pool.clone()).or_default().extend(nodes.iter().cloned());
        }

        // old + additions == desired + deletions as node sets
        assert_eq!(pairs(&grown), pairs(&shrunk));
    }
}

#[test]
fn test_unchanged_pool_in_no_bucket() {
    let diff = node_pools_diff(pools(&[("p1", &["n1"]), ("p2", &["x"])]), pools(&[("p1", &["n1"]), ("p2", &["y"])]));
    assert!(!diff.partially_deleted.contains_key("p1"));
    assert!(!diff.partially_added.contains_key("p1"));
    assert!(diff.deletes("p2", "x"));
    assert!(!diff.deletes("p1", "n1"));
}
