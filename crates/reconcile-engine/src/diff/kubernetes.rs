//! Kubernetes cluster diff
//!
//! Layers cluster-level semantics on top of the node-pool diffs: version,
//! proxy, template drift, autoscaler, pending deletions, metadata and the
//! placement of the API endpoint.

use super::labels::labels_taints_annotations_diff;
use super::nodepools::{NodePoolsDiff, node_pools_diff};
use crate::error::EngineError;
use crate::projection::{PoolNodes, pending_deletions, project};
use fleet_model::{K8sCluster, NodePool, PoolMetadataPatch, ProxyTransition};
use std::collections::BTreeMap;
use tracing::debug;

/// A node addressed by pool and node name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeRef {
    pub pool: String,
    pub node: String,
}

impl NodeRef {
    pub fn new(pool: impl Into<String>, node: impl Into<String>) -> Self {
        Self { pool: pool.into(), node: node.into() }
    }
}

/// Where the node-level API endpoint is and where it has to be.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiEndpointTracking {
    /// Node serving the endpoint in the current snapshot
    pub current: Option<NodeRef>,
    /// Node that must serve it once the diff is applied
    pub desired: Option<NodeRef>,
    /// The endpoint pool is being deleted and only control pools that do not
    /// exist yet could take over. Additions must run first.
    pub pending: bool,
}

impl ApiEndpointTracking {
    pub fn needs_move(&self) -> bool {
        matches!((&self.current, &self.desired), (Some(c), Some(d)) if c != d)
    }
}

/// Dynamic pool whose template commit changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollingUpdate {
    pub pool: String,
    pub current_commit: String,
    pub desired_commit: String,
}

/// Diff of two Kubernetes snapshots. Borrows both, so neither can change
/// while the diff is alive.
#[derive(Debug, Clone)]
pub struct KubernetesDiff<'a> {
    pub current: &'a K8sCluster,
    pub desired: &'a K8sCluster,
    pub version_changed: bool,
    pub proxy: ProxyTransition,
    pub dynamic: NodePoolsDiff,
    pub static_: NodePoolsDiff,
    pub rolling_updates: Vec<RollingUpdate>,
    pub autoscaler_gained: Vec<String>,
    pub autoscaler_lost: Vec<String>,
    /// Nodes flagged for deletion on both sides
    pub pending_deletions: PoolNodes,
    pub api_endpoint: ApiEndpointTracking,
    pub metadata: BTreeMap<String, PoolMetadataPatch>,
}

impl<'a> KubernetesDiff<'a> {
    /// Whether `node` of `pool` is removed by either node-pool diff.
    pub fn deletes(&self, pool: &str, node: &str) -> bool {
        self.dynamic.deletes(pool, node) || self.static_.deletes(pool, node)
    }

    pub fn deletes_pool(&self, pool: &str) -> bool {
        self.dynamic.deletes_pool(pool) || self.static_.deletes_pool(pool)
    }

    pub fn current_pool(&self, name: &str) -> Option<&'a NodePool> {
        self.current.info.pool(name)
    }

    pub fn desired_pool(&self, name: &str) -> Option<&'a NodePool> {
        self.desired.info.pool(name)
    }
}

pub fn proxy_transition(current: &K8sCluster, desired: &K8sCluster) -> ProxyTransition {
    match (&current.proxy, &desired.proxy) {
        (None, Some(_)) => ProxyTransition::On,
        (Some(_), None) => ProxyTransition::Off,
        (Some(c), Some(d)) if c.no_proxy != d.no_proxy || c.http_proxy_url != d.http_proxy_url => {
            ProxyTransition::Refresh
        }
        _ => ProxyTransition::NoChange,
    }
}

pub fn kubernetes_diff<'a>(current: &'a K8sCluster, desired: &'a K8sCluster) -> Result<KubernetesDiff<'a>, EngineError> {
    let old_view = project(&current.info);
    let new_view = project(&desired.info);
    let dynamic = node_pools_diff(old_view.dynamic, new_view.dynamic);
    let static_ = node_pools_diff(old_view.static_, new_view.static_);

    let mut rolling_updates = Vec::new();
    let mut autoscaler_gained = Vec::new();
    let mut autoscaler_lost = Vec::new();
    for old in &current.info.node_pools {
        let (Some(old_dyn), Some(new_dyn)) = (old.dynamic(), desired.info.pool(&old.name).and_then(NodePool::dynamic))
        else {
            continue;
        };
        if old_dyn.provider.template.commit_hash != new_dyn.provider.template.commit_hash {
            rolling_updates.push(RollingUpdate {
                pool: old.name.clone(),
                current_commit: old_dyn.provider.template.commit_hash.clone(),
                desired_commit: new_dyn.provider.template.commit_hash.clone(),
            });
        }
        match (&old_dyn.autoscaler, &new_dyn.autoscaler) {
            (None, Some(_)) => autoscaler_gained.push(old.name.clone()),
            (Some(_), None) => autoscaler_lost.push(old.name.clone()),
            _ => {}
        }
    }
    rolling_updates.sort_by(|a, b| a.pool.cmp(&b.pool));
    autoscaler_gained.sort();
    autoscaler_lost.sort();

    let pending_deletions = pending_deletions(&current.info, &desired.info);

    let mut diff = KubernetesDiff {
        current,
        desired,
        version_changed: current.kubernetes_version != desired.kubernetes_version,
        proxy: proxy_transition(current, desired),
        dynamic,
        static_,
        rolling_updates,
        autoscaler_gained,
        autoscaler_lost,
        pending_deletions,
        api_endpoint: ApiEndpointTracking::default(),
        metadata: labels_taints_annotations_diff(&current.info, &desired.info),
    };
    diff.api_endpoint = track_api_endpoint(&diff)?;

    debug!(
        "k8s diff {}: version_changed={} proxy={:?} rolling={} endpoint={:?}",
        current.id(),
        diff.version_changed,
        diff.proxy,
        diff.rolling_updates.len(),
        diff.api_endpoint
    );
    Ok(diff)
}

/// Keeps the endpoint where it is unless its pool or node is being deleted.
/// The replacement is the first surviving node (by name) of the first
/// surviving control pool (by name) that exists in both snapshots.
fn track_api_endpoint(diff: &KubernetesDiff<'_>) -> Result<ApiEndpointTracking, EngineError> {
    let Some((pool, node)) = diff.current.info.api_endpoint() else {
        return Ok(ApiEndpointTracking::default());
    };
    let current = NodeRef::new(&pool.name, &node.name);

    if !diff.deletes(&pool.name, &node.name) {
        return Ok(ApiEndpointTracking { desired: Some(current.clone()), current: Some(current), pending: false });
    }

    let mut candidates: Vec<&NodePool> = diff
        .current
        .info
        .control_pools()
        .filter(|p| !diff.deletes_pool(&p.name))
        .filter(|p| diff.desired.info.pool(&p.name).is_some_and(|d| d.control))
        .collect();
    candidates.sort_by(|a, b| a.name.cmp(&b.name));

    let replacement = candidates.iter().find_map(|p| {
        let mut nodes: Vec<&str> = p
            .nodes
            .iter()
            .filter(|n| !n.is_marked_for_deletion() && !diff.deletes(&p.name, &n.name))
            .map(|n| n.name.as_str())
            .collect();
        nodes.sort_unstable();
        nodes.first().map(|n| NodeRef::new(&p.name, *n))
    });

    match replacement {
        Some(desired) => Ok(ApiEndpointTracking { current: Some(current), desired: Some(desired), pending: false }),
        None if diff.desired.info.control_pools().any(|p| diff.current.info.pool(&p.name).is_none()) => {
            Ok(ApiEndpointTracking { current: Some(current), desired: None, pending: true })
        }
        None => Err(EngineError::NoControlPlaneCandidate(diff.current.id())),
    }
}
