//! Rolling updates of dynamic pools
//!
//! A pool whose template commit changed is never updated in place. A
//! sibling pool with a fresh name, keypair and CIDR is created from the
//! desired definition, the API endpoint is handed over if the old pool held
//! it, and the old pool is deleted. The desired snapshot is rewritten so it
//! names the sibling from then on.

use crate::diff::{NodeRef, RollingUpdate};
use crate::error::EngineError;
use crate::identity::IdentityGenerator;
use crate::pipeline::{self, PipelineContext};
use fleet_model::{Clusters, Node, NodeStatus, NodeType, TaskEvent};
use std::collections::BTreeSet;
use tracing::info;

/// Tasks of one rolling update and the desired snapshot naming the sibling.
#[derive(Debug, Clone)]
pub struct RollingPlan {
    pub sibling: String,
    /// Add sibling, optional endpoint move, delete original. Executed in order.
    pub tasks: Vec<TaskEvent>,
    pub desired: Clusters,
}

fn taken_cidrs(snapshots: &[&Clusters]) -> BTreeSet<String> {
    snapshots
        .iter()
        .filter_map(|c| c.k8s.as_ref())
        .flat_map(|k| k.info.node_pools.iter())
        .chain(snapshots.iter().flat_map(|c| c.load_balancers.iter()).flat_map(|lb| lb.info.node_pools.iter()))
        .filter_map(|p| p.dynamic())
        .map(|d| d.cidr.clone())
        .filter(|cidr| !cidr.is_empty())
        .collect()
}

/// Points every role that targets `old` at `new` as well. Unless
/// `keep_old` is set, `old` is dropped from the targets.
fn retarget(state: &mut Clusters, old: &str, new: &str, keep_old: bool) {
    for role in state.load_balancers.iter_mut().flat_map(|lb| lb.roles.iter_mut()) {
        if !role.target_pools.iter().any(|p| p == old) {
            continue;
        }
        if !keep_old {
            role.target_pools.retain(|p| p != old);
        }
        if !role.target_pools.iter().any(|p| p == new) {
            role.target_pools.push(new.to_string());
        }
    }
}

pub fn plan_rolling_update(
    current: &Clusters,
    desired: &Clusters,
    update: &RollingUpdate,
    identity: &dyn IdentityGenerator,
    ctx: &PipelineContext,
) -> Result<RollingPlan, EngineError> {
    let (Some(cur_k8s), Some(des_k8s)) = (current.k8s.as_ref(), desired.k8s.as_ref()) else {
        return Err(EngineError::InvalidState("rolling update without a cluster".to_string()));
    };
    let old = cur_k8s
        .info
        .pool(&update.pool)
        .ok_or_else(|| EngineError::InvalidState(format!("pool {} not found", update.pool)))?;
    let want = des_k8s
        .info
        .pool(&update.pool)
        .ok_or_else(|| EngineError::InvalidState(format!("pool {} not desired", update.pool)))?;
    let target_size = want
        .dynamic()
        .map(|d| d.autoscaler.as_ref().map_or(d.count, |a| a.target_size))
        .ok_or_else(|| EngineError::InvalidState(format!("pool {} is not dynamic", update.pool)))?;

    let origin = old.manifest_name().to_string();
    let mut sibling = want.clone();
    sibling.name = identity.pool_name(&origin);
    sibling.origin = Some(origin);
    let cidr = identity.cidr(&taken_cidrs(&[current, desired]))?;
    if let Some(d) = sibling.dynamic_mut() {
        d.cidr = cidr;
        d.ssh_keys = identity.keypair()?;
    }
    let node_type = if sibling.control { NodeType::Master } else { NodeType::Worker };
    sibling.nodes = (1..=target_size)
        .map(|i| Node {
            status: NodeStatus::Preparing,
            ..Node::new(format!("{}-{}-{:02}", cur_k8s.id(), sibling.name, i), "", node_type)
        })
        .collect();
    info!(
        "Rolling pool {} ({} -> {}) onto sibling {}",
        old.name, update.current_commit, update.desired_commit, sibling.name
    );

    let mut base = current.clone();
    retarget(&mut base, &old.name, &sibling.name, true);
    let add = pipeline::add_pool(&base, &sibling, ctx)?;
    let mut after = add.task.state.clone();
    let mut tasks = vec![add];

    if let Some(node) = old.nodes.iter().find(|n| n.is_api_endpoint()) {
        let to = sibling
            .nodes
            .first()
            .map(|n| NodeRef::new(&sibling.name, &n.name))
            .ok_or_else(|| EngineError::NoControlPlaneCandidate(cur_k8s.id()))?;
        let handover = pipeline::move_api_endpoint(&after, &NodeRef::new(&old.name, &node.name), &to, ctx)?;
        after = handover.task.state.clone();
        tasks.push(handover);
    }

    retarget(&mut after, &old.name, &sibling.name, false);
    tasks.push(pipeline::delete_pool(&after, &old.name, false, ctx)?);

    let mut patched = desired.clone();
    if let Some(pool) = patched.k8s.as_mut().and_then(|k| k.info.pool_mut(&update.pool)) {
        *pool = sibling.clone();
    }
    retarget(&mut patched, &old.name, &sibling.name, false);

    Ok(RollingPlan { sibling: sibling.name, tasks, desired: patched })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::transfer_identity;
    use crate::test_utils::*;
    use fleet_model::Delta;

    fn update(pool: &str) -> RollingUpdate {
        RollingUpdate { pool: pool.to_string(), current_commit: COMMIT.to_string(), desired_commit: "beef".to_string() }
    }

    #[test]
    fn test_worker_pool_rolls_in_two_tasks() {
        let current = clusters(
            k8s("prod", vec![dynamic_pool("control", true, &["c1"]), dynamic_pool("compute", false, &["w1", "w2"])]),
            vec![lb("lb1", "prod", vec![], vec![ingress_role("https", &["compute"])])],
        );
        let mut desired = current.clone();
        let pools = &mut desired.k8s.as_mut().unwrap().info.node_pools;
        pools[1] = with_commit(pools[1].clone(), "beef");
        let ctx = PipelineContext::new(&current, &desired);

        let plan = plan_rolling_update(&current, &desired, &update("compute"), &SequentialIdentity::new(), &ctx).unwrap();
        assert_eq!(plan.sibling, "compute-r00001");
        assert_eq!(plan.tasks.len(), 2);
        assert!(matches!(plan.tasks[0].task.delta, Delta::AddPool { ref pool, .. } if pool == "compute-r00001"));
        assert!(matches!(plan.tasks[1].task.delta, Delta::DeletePool { ref pool, skip_drain: false, .. } if pool == "compute"));
        assert_eq!(plan.tasks[1].on_error, pipeline::repeat_endless());

        let sibling = plan.tasks[0].task.state.k8s.as_ref().unwrap().info.pool("compute-r00001").unwrap();
        assert_eq!(sibling.nodes.len(), 2);
        assert_eq!(sibling.nodes[0].name, "prod-compute-r00001-01");
        assert_eq!(sibling.template_commit(), Some("beef"));
        assert_eq!(sibling.dynamic().unwrap().cidr, "10.0.1.0/24");
        assert_eq!(sibling.dynamic().unwrap().ssh_keys.private_key, "private-2");

        // While both pools exist the load balancer targets both.
        assert_eq!(plan.tasks[0].task.state.load_balancers[0].roles[0].target_pools, vec!["compute", "compute-r00001"]);
        assert_eq!(plan.tasks[1].task.state.load_balancers[0].roles[0].target_pools, vec!["compute-r00001"]);

        let rewritten = plan.desired.k8s.as_ref().unwrap();
        assert!(rewritten.info.pool("compute").is_none());
        assert_eq!(rewritten.info.pool("compute-r00001").unwrap().nodes.len(), 2);
        assert_eq!(plan.desired.load_balancers[0].roles[0].target_pools, vec!["compute-r00001"]);
    }

    #[test]
    fn test_rolled_pool_keeps_its_manifest_name() {
        let current = clusters(
            k8s("prod", vec![dynamic_pool("control", true, &["c1"]), dynamic_pool("gpu-worker", false, &["g1"])]),
            vec![],
        );
        let mut manifest = current.clone();
        let pools = &mut manifest.k8s.as_mut().unwrap().info.node_pools;
        pools[1] = with_commit(pools[1].clone(), "beef");
        let ids = SequentialIdentity::new();
        let ctx = PipelineContext::new(&current, &manifest);

        let plan = plan_rolling_update(&current, &manifest, &update("gpu-worker"), &ids, &ctx).unwrap();
        assert_eq!(plan.sibling, "gpu-worker-r00001");
        let sibling = plan.desired.k8s.as_ref().unwrap().info.pool("gpu-worker-r00001").unwrap();
        assert_eq!(sibling.origin.as_deref(), Some("gpu-worker"));

        // Once built, the manifest name resolves to the sibling again.
        let built = plan.desired.clone();
        let resolved = transfer_identity(&built, &manifest);
        let pool = &resolved.k8s.as_ref().unwrap().info.node_pools[1];
        assert_eq!(pool.name, "gpu-worker-r00001");
        assert_eq!(pool.nodes[0].name, "prod-gpu-worker-r00001-01");

        // A second roll derives the name from the manifest, not the sibling.
        let ctx = PipelineContext::new(&built, &resolved);
        let again = plan_rolling_update(&built, &resolved, &update("gpu-worker-r00001"), &ids, &ctx).unwrap();
        assert_eq!(again.sibling, "gpu-worker-r00003");
        let next = again.desired.k8s.as_ref().unwrap().info.pool("gpu-worker-r00003").unwrap();
        assert_eq!(next.origin.as_deref(), Some("gpu-worker"));
    }

    #[test]
    fn test_endpoint_pool_hands_over_before_deletion() {
        let current = clusters(k8s("prod", vec![dynamic_pool("control", true, &["c1"])]), vec![]);
        let mut desired = current.clone();
        let pools = &mut desired.k8s.as_mut().unwrap().info.node_pools;
        pools[0] = with_commit(pools[0].clone(), "beef");
        let ctx = PipelineContext::new(&current, &desired);

        let plan = plan_rolling_update(&current, &desired, &update("control"), &SequentialIdentity::new(), &ctx).unwrap();
        assert_eq!(plan.tasks.len(), 3);
        match &plan.tasks[1].task.delta {
            Delta::ApiEndpointMove { from_node, to_pool, to_node, .. } => {
                assert_eq!(from_node, "c1");
                assert_eq!(to_pool, "control-r00001");
                assert_eq!(to_node, "prod-control-r00001-01");
            }
            other => panic!("unexpected delta {other:?}"),
        }
        let after = plan.tasks[2].task.state.k8s.as_ref().unwrap();
        let (pool, _) = after.info.api_endpoint().unwrap();
        assert_eq!(pool.name, "control-r00001");
    }

    #[test]
    fn test_cidr_avoids_taken_ranges() {
        let current = clusters(
            k8s("prod", vec![dynamic_pool("control", true, &["c1"]), dynamic_pool("w", false, &["w1"])]),
            vec![],
        );
        let mut desired = current.clone();
        let pools = &mut desired.k8s.as_mut().unwrap().info.node_pools;
        pools[1] = with_commit(pools[1].clone(), "beef");
        let ctx = PipelineContext::new(&current, &desired);

        // "w" holds 10.0.1.0/24 in the fixtures.
        let plan = plan_rolling_update(&current, &desired, &update("w"), &SequentialIdentity::new(), &ctx).unwrap();
        let sibling = plan.desired.k8s.as_ref().unwrap().info.pool(&plan.sibling).unwrap();
        assert_eq!(sibling.dynamic().unwrap().cidr, "10.0.2.0/24");
    }
}
