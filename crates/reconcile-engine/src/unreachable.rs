//! Unreachable-node remediation
//!
//! Nodes that stopped answering are either already gone from the desired
//! state (delete them without draining) or still wanted. Wanted nodes are
//! only deleted when the live cluster confirms they were removed
//! out-of-band. Nothing here ever deletes the API endpoint or the last
//! control pool.

use crate::error::EngineError;
use crate::health::{HealthOracle, HealthReport};
use crate::pipeline::{self, PipelineContext};
use fleet_model::{Clusters, K8sCluster, Node, NodePool, TaskEvent};
use std::collections::BTreeSet;
use tracing::{info, warn};

fn node_list(nodes: &[Node]) -> String {
    nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>().join(", ")
}

/// Control nodes left in `cluster` once `removed` nodes of `pool` are gone.
fn remaining_control_nodes(cluster: &K8sCluster, pool: &str, removed: &BTreeSet<String>) -> usize {
    cluster
        .info
        .control_pools()
        .flat_map(|p| p.nodes.iter().map(move |n| (p, n)))
        .filter(|(p, n)| !n.is_marked_for_deletion() && !(p.name == pool && removed.contains(&n.name)))
        .count()
}

fn guard_control_plane(cluster: &K8sCluster, pool: &NodePool, removed: &BTreeSet<String>) -> Result<(), EngineError> {
    if let Some(node) = pool.nodes.iter().find(|n| n.is_api_endpoint() && removed.contains(&n.name)) {
        return Err(EngineError::UnreachableNodes(format!(
            "node {} of pool {} serves the API endpoint of {}; restore it or move the endpoint manually",
            node.name,
            pool.name,
            cluster.id()
        )));
    }
    if pool.control && remaining_control_nodes(cluster, &pool.name, removed) == 0 {
        return Err(EngineError::UnreachableNodes(format!(
            "removing pool {} would leave cluster {} without control nodes",
            pool.name,
            cluster.id()
        )));
    }
    Ok(())
}

/// Builds the task that deals with the first pool (by name) holding
/// unreachable nodes, or the error explaining why an operator must step in.
pub async fn remediate(
    oracle: &dyn HealthOracle,
    current: &Clusters,
    desired: &Clusters,
    report: &HealthReport,
    ctx: &PipelineContext,
) -> Result<TaskEvent, EngineError> {
    if let Some((pool_name, nodes)) = report.k8s.iter().next() {
        let cluster = current
            .k8s
            .as_ref()
            .ok_or_else(|| EngineError::InvalidState("unreachable nodes without a cluster".to_string()))?;
        let pool = cluster
            .info
            .pool(pool_name)
            .ok_or_else(|| EngineError::InvalidState(format!("pool {pool_name} not found")))?;
        let names: BTreeSet<String> = nodes.iter().map(|n| n.name.clone()).collect();

        let Some(desired_pool) = desired.k8s.as_ref().and_then(|k| k.info.pool(pool_name)) else {
            let whole: BTreeSet<String> = pool.nodes.iter().map(|n| n.name.clone()).collect();
            guard_control_plane(cluster, pool, &whole)?;
            info!("Pool {} is unreachable and no longer desired, deleting without drain", pool_name);
            return pipeline::delete_pool(current, pool_name, true, ctx);
        };

        let live = oracle.live_cluster_node_names(cluster).await?;
        let listed: Vec<Node> = nodes.iter().filter(|n| live.contains(&n.name)).cloned().collect();
        if !listed.is_empty() {
            return Err(EngineError::UnreachableNodes(format!(
                "nodes {} of pool {} are unreachable but still registered in cluster {}; fix the outage or remove them from the manifest",
                node_list(&listed),
                pool_name,
                cluster.id()
            )));
        }

        guard_control_plane(cluster, pool, &names)?;
        if desired_pool.is_static() {
            let declared: Vec<Node> = nodes
                .iter()
                .filter(|n| desired_pool.node(&n.name).is_some() || desired_pool.node_by_ip(&n.public_ip).is_some())
                .cloned()
                .collect();
            if !declared.is_empty() {
                return Err(EngineError::UnreachableNodes(format!(
                    "static nodes {} of pool {} were removed from the cluster but are still declared; remove them from the manifest",
                    node_list(&declared),
                    pool_name
                )));
            }
        }

        info!("Nodes {} of pool {} were removed out-of-band, confirming deletion", node_list(nodes), pool_name);
        return pipeline::delete_nodes(current, pool_name, &names, true, ctx);
    }

    if let Some((lb_id, pools)) = report.load_balancers.iter().next() {
        if let Some((pool_name, nodes)) = pools.iter().next() {
            let still_desired = desired
                .load_balancer(lb_id)
                .is_some_and(|lb| lb.info.pool(pool_name).is_some());
            if still_desired {
                warn!("Load balancer {} has unreachable nodes {}", lb_id, node_list(nodes));
                return Err(EngineError::UnreachableNodes(format!(
                    "nodes {} of load balancer {} pool {} are unreachable; fix the outage or remove the pool from the manifest",
                    node_list(nodes),
                    lb_id,
                    pool_name
                )));
            }
            let names: BTreeSet<String> = nodes.iter().map(|n| n.name.clone()).collect();
            return pipeline::delete_lb_nodes(current, lb_id, pool_name, &names, true, ctx);
        }
    }

    Err(EngineError::InvalidState("no unreachable nodes to remediate".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use fleet_model::Delta;

    async fn run(oracle: &StaticOracle, current: &Clusters, desired: &Clusters) -> Result<TaskEvent, EngineError> {
        let report = HealthReport::collect(oracle, current).await.unwrap();
        let ctx = PipelineContext::new(current, desired);
        remediate(oracle, current, desired, &report, &ctx).await
    }

    #[tokio::test]
    async fn test_only_control_pool_with_endpoint_is_refused() {
        let current = clusters(
            k8s("prod", vec![dynamic_pool("control", true, &["c1"]), dynamic_pool("compute", false, &["w1"])]),
            vec![],
        );
        let mut desired = current.clone();
        desired.k8s.as_mut().unwrap().info.node_pools.remove(0);
        let oracle = StaticOracle::new().with_unreachable(&[&ip_of("c1")]);

        let err = run(&oracle, &current, &desired).await.unwrap_err();
        assert!(matches!(err, EngineError::UnreachableNodes(_)));
        assert!(err.is_blocking());
    }

    #[tokio::test]
    async fn test_undesired_pool_is_deleted_without_drain() {
        let current = clusters(
            k8s("prod", vec![dynamic_pool("control", true, &["c1"]), dynamic_pool("compute", false, &["w1", "w2"])]),
            vec![],
        );
        let mut desired = current.clone();
        desired.k8s.as_mut().unwrap().info.node_pools.remove(1);
        let oracle = StaticOracle::new().with_unreachable(&[&ip_of("w2")]);

        let task = run(&oracle, &current, &desired).await.unwrap();
        assert!(matches!(task.task.delta, Delta::DeletePool { ref pool, skip_drain: true, .. } if pool == "compute"));
    }

    #[tokio::test]
    async fn test_listed_node_is_a_genuine_outage() {
        let current = clusters(
            k8s("prod", vec![dynamic_pool("control", true, &["c1"]), dynamic_pool("compute", false, &["w1"])]),
            vec![],
        );
        let oracle = StaticOracle::new().with_unreachable(&[&ip_of("w1")]).with_live_nodes(&["c1", "w1"]);

        let err = run(&oracle, &current, &current).await.unwrap_err();
        assert!(err.to_string().contains("still registered"));
    }

    #[tokio::test]
    async fn test_unlisted_node_is_confirmed_deleted() {
        let current = clusters(
            k8s("prod", vec![dynamic_pool("control", true, &["c1"]), dynamic_pool("compute", false, &["w1", "w2"])]),
            vec![],
        );
        let oracle = StaticOracle::new().with_unreachable(&[&ip_of("w1")]).with_live_nodes(&["c1", "w2"]);

        let task = run(&oracle, &current, &current).await.unwrap();
        match task.task.delta {
            Delta::DeleteNodes { pool, nodes, skip_drain } => {
                assert_eq!(pool, "compute");
                assert_eq!(nodes, vec!["w1".to_string()]);
                assert!(skip_drain);
            }
            other => panic!("unexpected delta {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_declared_static_node_needs_manifest_edit() {
        let current = clusters(
            k8s("prod", vec![dynamic_pool("control", true, &["c1"]), static_pool("onprem", false, &["s1"])]),
            vec![],
        );
        let oracle = StaticOracle::new().with_unreachable(&[&ip_of("s1")]).with_live_nodes(&["c1"]);

        let err = run(&oracle, &current, &current).await.unwrap_err();
        assert!(err.to_string().contains("remove them from the manifest"));
    }

    #[tokio::test]
    async fn test_live_listing_failure_propagates() {
        let current = clusters(
            k8s("prod", vec![dynamic_pool("control", true, &["c1"]), dynamic_pool("compute", false, &["w1"])]),
            vec![],
        );
        let oracle = StaticOracle::new().with_unreachable(&[&ip_of("w1")]);

        let err = run(&oracle, &current, &current).await.unwrap_err();
        assert!(matches!(err, EngineError::Oracle(_)));
    }

    #[tokio::test]
    async fn test_load_balancer_pool_still_desired_is_refused() {
        let current = clusters(
            k8s("prod", vec![dynamic_pool("control", true, &["c1"])]),
            vec![lb("lb1", "prod", vec![dynamic_pool("lbpool", false, &["l1"])], vec![])],
        );
        let oracle = StaticOracle::new().with_unreachable(&[&ip_of("l1")]);
        assert!(run(&oracle, &current, &current).await.unwrap_err().is_blocking());

        let mut desired = current.clone();
        desired.load_balancers[0].info.node_pools.clear();
        let task = run(&oracle, &current, &desired).await.unwrap();
        assert!(matches!(task.task.delta, Delta::DeleteLbNodes { whole_pool: true, .. }));
    }
}
