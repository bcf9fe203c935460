//! Builders for Kubernetes node and cluster changes

use super::*;
use crate::diff::NodeRef;
use crate::health::VpnDrift;
use fleet_model::{
    Delta, EventKind, NodePool, NodeType, PoolMetadataPatch, ProxySettings, ProxyTransition, Task,
};
use std::collections::BTreeMap;

fn names(nodes: &[fleet_model::Node]) -> Vec<String> {
    nodes.iter().map(|n| n.name.clone()).collect()
}

/// Stages for nodes joining the cluster, in `pool` as it will look after the change.
fn addition_pipeline(state: &Clusters, pool: &NodePool, ctx: &PipelineContext) -> Vec<Stage> {
    let mut patches = vec![SubPass::fatal(SubPassKind::PatchNodes, "label, annotate and taint new nodes")];
    if pool.control && ctx.api_server_active {
        patches.extend(control_plane_patches());
    }
    if pool.dynamic().is_some_and(|d| d.autoscaler.is_some()) {
        patches.push(SubPass::fatal(SubPassKind::DeployAutoscaler, "deploy cluster autoscaler"));
    }

    let provisioning = if pool.is_dynamic() {
        vec![SubPass::fatal(SubPassKind::BuildInfrastructure, format!("build infrastructure for {}", pool.name))]
    } else {
        Vec::new()
    };

    PipelineBuilder::new()
        .stage(StageKind::Provisioning, "provision nodes", provisioning)
        .stage(
            StageKind::Configuration,
            "configure nodes",
            node_configuration(ctx.proxy_enabled, ctx.targets(&pool.name, state)),
        )
        .stage(StageKind::ClusterBootstrap, "join nodes", reconcile_cluster("join nodes to the cluster"))
        .stage(StageKind::ClusterConfiguration, "patch cluster", patches)
        .build()
}

/// Stages for nodes leaving the cluster. Configuration only runs when the
/// proxy, static cleanup or the load balancers need it.
fn deletion_pipeline(state: &Clusters, pool: &NodePool, ctx: &PipelineContext, skip_drain: bool) -> Vec<Stage> {
    let delete_about = if skip_drain { "delete nodes without draining" } else { "drain and delete nodes" };

    let mut configuration = proxy_refresh(ctx.proxy_enabled);
    if pool.is_static() {
        configuration.push(SubPass::warn(SubPassKind::RemoveUtilities, "remove utilities from static nodes"));
    }
    if ctx.targets(&pool.name, state) {
        configuration.push(SubPass::fatal(SubPassKind::ReconcileLoadBalancers, "reconcile load balancers"));
    }

    let provisioning = if pool.is_dynamic() {
        vec![SubPass::fatal(SubPassKind::DestroyInfrastructure, format!("destroy infrastructure of {}", pool.name))]
    } else {
        Vec::new()
    };

    let control = pool.control && ctx.api_server_active;
    PipelineBuilder::new()
        .stage(
            StageKind::ClusterConfiguration,
            "remove nodes from cluster",
            vec![SubPass::fatal(SubPassKind::DeleteNodes, delete_about)],
        )
        .stage(StageKind::Configuration, "reconfigure remaining nodes", configuration)
        .stage(StageKind::Provisioning, "release infrastructure", provisioning)
        .stage(
            StageKind::ClusterBootstrap,
            "regenerate certificates",
            if control { reconcile_cluster("regenerate control plane certificates") } else { Vec::new() },
        )
        .stage(
            StageKind::ClusterConfiguration,
            "patch control plane config",
            if control { control_plane_patches() } else { Vec::new() },
        )
        .build()
}

pub fn add_pool(current: &Clusters, pool: &NodePool, ctx: &PipelineContext) -> Result<TaskEvent, EngineError> {
    let mut added = pool.clone();
    for node in added.nodes.iter_mut() {
        node.status = NodeStatus::Preparing;
    }

    let mut state = current.clone();
    let k8s = k8s_mut(&mut state)?;
    if k8s.info.pool(&added.name).is_some() {
        return Err(EngineError::InvalidState(format!("pool {} already exists", added.name)));
    }
    k8s.info.node_pools.push(added.clone());

    let undo = delete_pool(&state, &added.name, false, ctx)?;
    let pipeline = addition_pipeline(&state, &added, ctx);
    Ok(TaskEvent::new(
        EventKind::Update,
        format!("add node pool {}", added.name),
        Task { state, delta: Delta::AddPool { pool: added.name.clone(), nodes: names(&added.nodes) } },
        pipeline,
        rollback(vec![undo]),
    ))
}

pub fn add_nodes(
    current: &Clusters,
    desired_pool: &NodePool,
    nodes: &BTreeSet<String>,
    ctx: &PipelineContext,
) -> Result<TaskEvent, EngineError> {
    let mut state = current.clone();
    let pool = k8s_mut(&mut state)?
        .info
        .pool_mut(&desired_pool.name)
        .ok_or_else(|| EngineError::InvalidState(format!("pool {} not found", desired_pool.name)))?;

    let mut added = Vec::new();
    for node in desired_pool.nodes.iter().filter(|n| nodes.contains(&n.name)) {
        let mut node = node.clone();
        node.status = NodeStatus::Preparing;
        added.push(node.name.clone());
        pool.nodes.push(node);
    }
    if let (Some(d), Some(want)) = (pool.dynamic_mut(), desired_pool.dynamic()) {
        d.count = want.count;
        d.autoscaler = want.autoscaler.clone();
    }
    let pool = pool.clone();

    let undo = delete_nodes(&state, &pool.name, nodes, false, ctx)?;
    let pipeline = addition_pipeline(&state, &pool, ctx);
    Ok(TaskEvent::new(
        EventKind::Update,
        format!("add {} nodes to pool {}", added.len(), pool.name),
        Task { state, delta: Delta::AddNodes { pool: pool.name.clone(), nodes: added } },
        pipeline,
        rollback(vec![undo]),
    ))
}

pub fn delete_pool(
    current: &Clusters,
    pool_name: &str,
    skip_drain: bool,
    ctx: &PipelineContext,
) -> Result<TaskEvent, EngineError> {
    let mut state = current.clone();
    let pool = k8s_mut(&mut state)?
        .info
        .pool_mut(pool_name)
        .ok_or_else(|| EngineError::InvalidState(format!("pool {pool_name} not found")))?;
    mark_for_deletion(pool.nodes.iter_mut());
    let pool = pool.clone();

    let pipeline = deletion_pipeline(&state, &pool, ctx, skip_drain);
    Ok(TaskEvent::new(
        EventKind::Delete,
        format!("delete node pool {pool_name}"),
        Task {
            state,
            delta: Delta::DeletePool { pool: pool_name.to_string(), nodes: names(&pool.nodes), skip_drain },
        },
        pipeline,
        repeat_endless(),
    ))
}

pub fn delete_nodes(
    current: &Clusters,
    pool_name: &str,
    nodes: &BTreeSet<String>,
    skip_drain: bool,
    ctx: &PipelineContext,
) -> Result<TaskEvent, EngineError> {
    let mut state = current.clone();
    let pool = k8s_mut(&mut state)?
        .info
        .pool_mut(pool_name)
        .ok_or_else(|| EngineError::InvalidState(format!("pool {pool_name} not found")))?;
    mark_for_deletion(pool.nodes.iter_mut().filter(|n| nodes.contains(&n.name)));
    let pool = pool.clone();

    let pipeline = deletion_pipeline(&state, &pool, ctx, skip_drain);
    Ok(TaskEvent::new(
        EventKind::Delete,
        format!("delete {} nodes from pool {pool_name}", nodes.len()),
        Task {
            state,
            delta: Delta::DeleteNodes {
                pool: pool_name.to_string(),
                nodes: nodes.iter().cloned().collect(),
                skip_drain,
            },
        },
        pipeline,
        repeat_endless(),
    ))
}

/// Hands the API endpoint from one control node to another.
pub fn move_api_endpoint(
    current: &Clusters,
    from: &NodeRef,
    to: &NodeRef,
    ctx: &PipelineContext,
) -> Result<TaskEvent, EngineError> {
    let mut state = current.clone();
    let k8s = k8s_mut(&mut state)?;
    let mut found = false;
    for pool in k8s.info.node_pools.iter_mut() {
        for node in pool.nodes.iter_mut() {
            if pool.name == from.pool && node.name == from.node {
                node.node_type = NodeType::Master;
            }
            if pool.name == to.pool && node.name == to.node {
                node.node_type = NodeType::ApiEndpoint;
                found = true;
            }
        }
    }
    if !found {
        return Err(EngineError::InvalidState(format!("endpoint target {}/{} not found", to.pool, to.node)));
    }

    let mut configuration = Vec::new();
    if ctx.proxy_enabled {
        configuration.push(SubPass::fatal(SubPassKind::UpdateProxyEnvs, "add new endpoint to no-proxy list"));
    }
    configuration.push(SubPass::fatal(SubPassKind::UpdateApiEndpoint, format!("move API endpoint to {}", to.node)));
    if ctx.proxy_enabled {
        configuration.push(SubPass::fatal(SubPassKind::CommitProxyEnvs, "commit proxy envs"));
    }

    let pipeline = PipelineBuilder::new()
        .stage(StageKind::Configuration, "move API endpoint", configuration)
        .stage(StageKind::ClusterBootstrap, "regenerate certificates", reconcile_cluster("regenerate certificates"))
        .stage(StageKind::ClusterConfiguration, "patch control plane config", control_plane_patches())
        .build();

    Ok(TaskEvent::new(
        EventKind::Update,
        format!("move API endpoint from {}/{} to {}/{}", from.pool, from.node, to.pool, to.node),
        Task {
            state,
            delta: Delta::ApiEndpointMove {
                from_pool: from.pool.clone(),
                from_node: from.node.clone(),
                to_pool: to.pool.clone(),
                to_node: to.node.clone(),
            },
        },
        pipeline,
        repeat_endless(),
    ))
}

pub fn upgrade_version(current: &Clusters, version: &str) -> Result<TaskEvent, EngineError> {
    let mut state = current.clone();
    let k8s = k8s_mut(&mut state)?;
    let from = std::mem::replace(&mut k8s.kubernetes_version, version.to_string());

    let pipeline = PipelineBuilder::new()
        .stage(
            StageKind::ClusterBootstrap,
            "upgrade kubernetes",
            reconcile_cluster(&format!("upgrade kubernetes to {version}")),
        )
        .build();
    Ok(TaskEvent::new(
        EventKind::Update,
        format!("upgrade kubernetes from {from} to {version}"),
        Task { state, delta: Delta::UpgradeVersion { from, to: version.to_string() } },
        pipeline,
        repeat_endless(),
    ))
}

pub fn toggle_proxy(
    current: &Clusters,
    proxy: Option<&ProxySettings>,
    transition: ProxyTransition,
) -> Result<TaskEvent, EngineError> {
    let mut state = current.clone();
    k8s_mut(&mut state)?.proxy = proxy.cloned();

    let pipeline = PipelineBuilder::new()
        .stage(StageKind::Configuration, "apply proxy settings", proxy_refresh(true))
        .stage(
            StageKind::ClusterBootstrap,
            "restart control plane components",
            reconcile_cluster("propagate proxy settings"),
        )
        .build();
    Ok(TaskEvent::new(
        EventKind::Update,
        format!("proxy {transition:?}"),
        Task { state, delta: Delta::Proxy { transition } },
        pipeline,
        repeat_bounded(),
    ))
}

/// Copies labels, annotations and taints of the patched pools from `desired`.
pub fn patch_nodes(
    current: &Clusters,
    desired: &K8sCluster,
    patches: &BTreeMap<String, PoolMetadataPatch>,
) -> Result<TaskEvent, EngineError> {
    let mut state = current.clone();
    let k8s = k8s_mut(&mut state)?;
    for name in patches.keys() {
        if let (Some(pool), Some(want)) = (k8s.info.pool_mut(name), desired.info.pool(name)) {
            pool.labels = want.labels.clone();
            pool.annotations = want.annotations.clone();
            pool.taints = want.taints.clone();
        }
    }

    let pipeline = PipelineBuilder::new()
        .stage(
            StageKind::ClusterConfiguration,
            "patch node metadata",
            vec![SubPass::fatal(SubPassKind::PatchNodes, "patch labels, annotations and taints")],
        )
        .build();
    Ok(TaskEvent::new(
        EventKind::Update,
        format!("patch metadata of pools {}", patches.keys().cloned().collect::<Vec<_>>().join(", ")),
        Task { state, delta: Delta::PatchNodes { pools: patches.clone() } },
        pipeline,
        repeat_bounded(),
    ))
}

pub fn autoscaler(
    current: &Clusters,
    desired: &K8sCluster,
    gained: &[String],
    lost: &[String],
) -> Result<TaskEvent, EngineError> {
    let mut state = current.clone();
    let k8s = k8s_mut(&mut state)?;
    for name in gained.iter().chain(lost.iter()) {
        let want = desired.info.pool(name).and_then(NodePool::dynamic);
        if let (Some(d), Some(want)) = (k8s.info.pool_mut(name).and_then(NodePool::dynamic_mut), want) {
            d.autoscaler = want.autoscaler.clone();
            d.count = want.count;
        }
    }
    let any_autoscaled = k8s.info.node_pools.iter().any(|p| p.dynamic().is_some_and(|d| d.autoscaler.is_some()));

    let pass = if any_autoscaled {
        SubPass::fatal(SubPassKind::DeployAutoscaler, "deploy cluster autoscaler")
    } else {
        SubPass::fatal(SubPassKind::DestroyAutoscaler, "remove cluster autoscaler")
    };
    let pipeline = PipelineBuilder::new()
        .stage(StageKind::ClusterConfiguration, "reconcile autoscaler", vec![pass])
        .build();
    Ok(TaskEvent::new(
        EventKind::Update,
        format!("autoscaler gained by {:?}, lost by {:?}", gained, lost),
        Task { state, delta: Delta::Autoscaler { gained: gained.to_vec(), lost: lost.to_vec() } },
        pipeline,
        repeat_bounded(),
    ))
}

pub fn vpn_refresh(current: &Clusters, drift: VpnDrift) -> TaskEvent {
    let pipeline = PipelineBuilder::new()
        .stage(
            StageKind::Configuration,
            "refresh VPN mesh",
            vec![SubPass::fatal(SubPassKind::InstallVpn, "reinstall VPN peers")],
        )
        .build();
    TaskEvent::new(
        EventKind::Update,
        format!("refresh VPN mesh ({} peers expected, {} seen)", drift.expected, drift.observed),
        Task {
            state: current.clone(),
            delta: Delta::VpnRefresh { expected_peers: drift.expected, observed_peers: drift.observed },
        },
        pipeline,
        repeat_bounded(),
    )
}
