//! Node-pool set difference

use crate::projection::PoolNodes;
use std::collections::BTreeSet;

/// Four disjoint buckets describing how to get from one projection to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodePoolsDiff {
    /// Pools that exist only in the old projection, with all their nodes
    pub deleted: PoolNodes,
    /// Pools that exist only in the desired projection, with all their nodes
    pub added: PoolNodes,
    /// Shared pools that lose nodes
    pub partially_deleted: PoolNodes,
    /// Shared pools that gain nodes
    pub partially_added: PoolNodes,
}

impl NodePoolsDiff {
    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty()
            && self.added.is_empty()
            && self.partially_deleted.is_empty()
            && self.partially_added.is_empty()
    }

    /// Whether `node` of `pool` is removed, wholly or partially.
    pub fn deletes(&self, pool: &str, node: &str) -> bool {
        self.deleted.contains_key(pool)
            || self.partially_deleted.get(pool).is_some_and(|nodes| nodes.contains(node))
    }

    pub fn deletes_pool(&self, pool: &str) -> bool {
        self.deleted.contains_key(pool)
    }

    pub fn adds_pool(&self, pool: &str) -> bool {
        self.added.contains_key(pool)
    }
}

/// Classifies whole pools first: a pool missing on one side lands in
/// `deleted`/`added` with all of its nodes, even when it has none. Pools
/// present on both sides are then compared node by node; unchanged pools
/// appear in no bucket.
pub fn node_pools_diff(old: PoolNodes, desired: PoolNodes) -> NodePoolsDiff {
    let (shared_old, deleted): (PoolNodes, PoolNodes) =
        old.into_iter().partition(|(name, _)| desired.contains_key(name));
    let (mut shared_desired, added): (PoolNodes, PoolNodes) =
        desired.into_iter().partition(|(name, _)| shared_old.contains_key(name));

    let mut diff = NodePoolsDiff { deleted, added, ..Default::default() };

    for (name, old_nodes) in shared_old {
        let desired_nodes = shared_desired.remove(&name).unwrap_or_default();

        let removed: BTreeSet<String> = old_nodes.difference(&desired_nodes).cloned().collect();
        let gained: BTreeSet<String> = desired_nodes.difference(&old_nodes).cloned().collect();
        if !removed.is_empty() {
            diff.partially_deleted.insert(name.clone(), removed);
        }
        if !gained.is_empty() {
            diff.partially_added.insert(name, gained);
        }
    }

    diff
}
