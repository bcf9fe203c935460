//! Whole-cluster create and destroy

use super::*;
use crate::projection::place_api_endpoint;
use fleet_model::{ClusterInfo, Delta, EventKind, NodePool, Task};

fn infos(state: &Clusters) -> impl Iterator<Item = &ClusterInfo> {
    state.k8s.iter().map(|k| &k.info).chain(state.load_balancers.iter().map(|lb| &lb.info))
}

/// Builds everything in `desired`. The API endpoint goes to the first
/// ApiServer load balancer, or the first control node when there is none.
/// Rolls back by destroying what was built.
pub fn create(desired: &Clusters) -> Result<TaskEvent, EngineError> {
    let mut state = desired.clone();
    place_api_endpoint(&mut state);
    for info in [state.k8s.as_mut().map(|k| &mut k.info)]
        .into_iter()
        .flatten()
        .chain(state.load_balancers.iter_mut().map(|lb| &mut lb.info))
    {
        for node in info.node_pools.iter_mut().flat_map(|p| p.nodes.iter_mut()) {
            node.status = NodeStatus::Preparing;
        }
    }

    let k8s = state
        .k8s
        .as_ref()
        .ok_or_else(|| EngineError::InvalidState("cannot create load balancers without a cluster".to_string()))?;
    let id = k8s.id();
    let proxy = k8s.proxy_enabled();
    let autoscaled = k8s.info.node_pools.iter().any(|p| p.dynamic().is_some_and(|d| d.autoscaler.is_some()));
    let has_dynamic = infos(&state).any(ClusterInfo::has_dynamic_pools);
    let has_dns = state.load_balancers.iter().any(|lb| lb.dns.is_some());

    let mut provisioning = Vec::new();
    if has_dynamic {
        provisioning.push(SubPass::fatal(SubPassKind::BuildInfrastructure, "build infrastructure"));
    }
    if has_dns {
        provisioning.push(SubPass::fatal(SubPassKind::ReconcileDns, "create DNS records"));
    }
    let mut cluster_config = vec![
        SubPass::fatal(SubPassKind::SetupStorage, "set up storage"),
        SubPass::fatal(SubPassKind::StoreKubeconfig, "store kubeconfig"),
        SubPass::fatal(SubPassKind::StoreClusterMetadata, "store cluster metadata"),
        SubPass::fatal(SubPassKind::PatchNodes, "label, annotate and taint nodes"),
    ];
    if autoscaled {
        cluster_config.push(SubPass::fatal(SubPassKind::DeployAutoscaler, "deploy cluster autoscaler"));
    }

    let pipeline = PipelineBuilder::new()
        .stage(StageKind::Provisioning, "provision infrastructure", provisioning)
        .stage(
            StageKind::Configuration,
            "configure nodes",
            node_configuration(proxy, !state.load_balancers.is_empty()),
        )
        .stage(StageKind::ClusterBootstrap, "bootstrap cluster", reconcile_cluster("bootstrap kubernetes"))
        .stage(StageKind::ClusterConfiguration, "configure cluster", cluster_config)
        .build();

    let undo = destroy(&state);
    Ok(TaskEvent::new(
        EventKind::Create,
        format!("create cluster {id}"),
        Task { state, delta: Delta::Create },
        pipeline,
        rollback(vec![undo]),
    ))
}

/// Tears down everything in `state`. Metadata cleanup is best effort.
pub fn destroy(state: &Clusters) -> TaskEvent {
    let mut state = state.clone();
    if let Some(k8s) = state.k8s.as_mut() {
        mark_for_deletion(k8s.info.node_pools.iter_mut().flat_map(|p| p.nodes.iter_mut()));
    }
    for lb in state.load_balancers.iter_mut() {
        mark_for_deletion(lb.info.node_pools.iter_mut().flat_map(|p| p.nodes.iter_mut()));
    }

    let has_static = infos(&state).any(ClusterInfo::has_static_pools);
    let has_dynamic = infos(&state).any(ClusterInfo::has_dynamic_pools);
    let has_dns = state.load_balancers.iter().any(|lb| lb.dns.is_some());

    let mut provisioning = Vec::new();
    if has_dns {
        provisioning.push(SubPass::fatal(SubPassKind::DestroyDns, "delete DNS records"));
    }
    if has_dynamic {
        provisioning.push(SubPass::fatal(SubPassKind::DestroyInfrastructure, "destroy infrastructure"));
    }
    let static_cleanup = if has_static {
        vec![SubPass::warn(SubPassKind::RemoveUtilities, "remove utilities from static nodes")]
    } else {
        Vec::new()
    };
    let static_reset = if has_static && state.k8s.is_some() {
        vec![SubPass::fatal(SubPassKind::DestroyCluster, "reset kubernetes on static nodes")]
    } else {
        Vec::new()
    };

    let pipeline = PipelineBuilder::new()
        .stage(
            StageKind::ClusterConfiguration,
            "clean up cluster metadata",
            vec![
                SubPass::warn(SubPassKind::DeleteKubeconfig, "delete kubeconfig"),
                SubPass::warn(SubPassKind::DeleteClusterMetadata, "delete cluster metadata"),
            ],
        )
        .stage(StageKind::ClusterBootstrap, "tear down kubernetes", static_reset)
        .stage(StageKind::Configuration, "clean static nodes", static_cleanup)
        .stage(StageKind::Provisioning, "release infrastructure", provisioning)
        .build();

    let id = state
        .k8s
        .as_ref()
        .map(|k| k.id())
        .or_else(|| state.load_balancers.first().map(|lb| lb.id()))
        .unwrap_or_default();
    TaskEvent::new(
        EventKind::Delete,
        format!("destroy cluster {id}"),
        Task { state, delta: Delta::Destroy },
        pipeline,
        repeat_endless(),
    )
}

fn merge_pools(into: &mut ClusterInfo, from: &ClusterInfo) {
    for pool in &from.node_pools {
        match into.pool_mut(&pool.name) {
            Some(existing) => {
                for node in &pool.nodes {
                    if existing.node(&node.name).is_none() {
                        existing.nodes.push(node.clone());
                    }
                }
            }
            None => into.node_pools.push(NodePool::clone(pool)),
        }
    }
}

/// Everything that exists in either snapshot. Used to destroy a cluster
/// together with whatever a half-applied task may have built.
pub fn union(current: &Clusters, fragment: &Clusters) -> Clusters {
    let mut out = current.clone();
    if let Some(k8s) = &fragment.k8s {
        match out.k8s.as_mut() {
            Some(existing) => merge_pools(&mut existing.info, &k8s.info),
            None => out.k8s = Some(k8s.clone()),
        }
    }
    for lb in &fragment.load_balancers {
        match out.load_balancer_mut(&lb.id()) {
            Some(existing) => merge_pools(&mut existing.info, &lb.info),
            None => out.load_balancers.push(lb.clone()),
        }
    }
    out
}
