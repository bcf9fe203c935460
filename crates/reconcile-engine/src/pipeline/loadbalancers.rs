//! Builders for load-balancer changes

use super::*;
use crate::projection::place_api_endpoint;
use fleet_model::{ApiEndpointChange, Delta, EventKind, NodePool, NodeType, RoleType, Task};
use std::collections::BTreeMap;

fn has_dynamic_pools(lb: &LoadBalancerCluster) -> bool {
    lb.info.has_dynamic_pools()
}

fn lb_reconcile() -> Vec<SubPass> {
    vec![SubPass::fatal(SubPassKind::ReconcileLoadBalancers, "reconcile load balancers")]
}

/// Endpoint update on the cluster nodes, bracketed by proxy envs when needed.
fn endpoint_configuration(ctx: &PipelineContext) -> Vec<SubPass> {
    let mut passes = Vec::new();
    if ctx.proxy_enabled {
        passes.push(SubPass::fatal(SubPassKind::UpdateProxyEnvs, "add endpoint to no-proxy list"));
    }
    passes.push(SubPass::fatal(SubPassKind::ReconcileLoadBalancers, "reconcile load balancers"));
    passes.push(SubPass::fatal(SubPassKind::UpdateApiEndpoint, "point nodes at the new API endpoint"));
    if ctx.proxy_enabled {
        passes.push(SubPass::fatal(SubPassKind::CommitProxyEnvs, "commit proxy envs"));
    }
    passes
}

/// Takes the roles of `id` from `desired`; a load balancer that no longer
/// exists there just loses its ApiServer roles.
fn sync_roles(state: &mut Clusters, desired: &Clusters, id: &str) -> Result<(), EngineError> {
    let want = desired.load_balancer(id).map(|lb| lb.roles.clone());
    let lb = lb_mut(state, id)?;
    match want {
        Some(roles) => lb.roles = roles,
        None => lb.roles.retain(|r| r.role_type != RoleType::ApiServer),
    }
    Ok(())
}

fn demote_api_endpoint(state: &mut Clusters) {
    if let Some(k8s) = state.k8s.as_mut() {
        for node in k8s.info.node_pools.iter_mut().flat_map(|p| p.nodes.iter_mut()) {
            if node.is_api_endpoint() {
                node.node_type = NodeType::Master;
            }
        }
    }
}

/// Moves the API endpoint onto, off or between load balancers.
pub fn lb_api_endpoint(
    current: &Clusters,
    desired: &Clusters,
    change: &ApiEndpointChange,
    ctx: &PipelineContext,
) -> Result<TaskEvent, EngineError> {
    let mut state = current.clone();
    let (description, dns) = match change {
        ApiEndpointChange::NoChange => {
            return Err(EngineError::InvalidState("no API endpoint change to apply".to_string()));
        }
        ApiEndpointChange::AttachingLoadBalancer { desired: id } => {
            sync_roles(&mut state, desired, id)?;
            demote_api_endpoint(&mut state);
            (format!("attach API endpoint to load balancer {id}"), true)
        }
        ApiEndpointChange::DetachingLoadBalancer { current: id } => {
            sync_roles(&mut state, desired, id)?;
            place_api_endpoint(&mut state);
            if state.k8s.as_ref().and_then(|k| k.info.api_endpoint()).is_none() {
                return Err(EngineError::NoControlPlaneCandidate(
                    state.k8s.as_ref().map(K8sCluster::id).unwrap_or_default(),
                ));
            }
            (format!("detach API endpoint from load balancer {id}"), false)
        }
        ApiEndpointChange::MoveEndpoint { current: from, desired: to } => {
            sync_roles(&mut state, desired, from)?;
            sync_roles(&mut state, desired, to)?;
            (format!("move API endpoint from load balancer {from} to {to}"), true)
        }
        ApiEndpointChange::EndpointRenamed { id } => {
            let dns = desired.load_balancer(id).and_then(|lb| lb.dns.clone());
            lb_mut(&mut state, id)?.dns = dns;
            (format!("rename API endpoint of load balancer {id}"), true)
        }
    };

    let provisioning = if dns {
        vec![SubPass::fatal(SubPassKind::ReconcileDns, "reconcile API endpoint DNS")]
    } else {
        Vec::new()
    };
    let pipeline = PipelineBuilder::new()
        .stage(StageKind::Provisioning, "reconcile DNS", provisioning)
        .stage(StageKind::Configuration, "switch API endpoint", endpoint_configuration(ctx))
        .stage(StageKind::ClusterBootstrap, "regenerate certificates", reconcile_cluster("regenerate certificates"))
        .stage(StageKind::ClusterConfiguration, "patch control plane config", control_plane_patches())
        .build();

    Ok(TaskEvent::new(
        EventKind::Update,
        description,
        Task { state, delta: Delta::LbApiEndpoint { change: change.clone() } },
        pipeline,
        repeat_endless(),
    ))
}

/// Replaces the DNS record of a load balancer. When it serves the API the
/// nodes and certificates follow.
pub fn replace_dns(
    current: &Clusters,
    desired_lb: &LoadBalancerCluster,
    ctx: &PipelineContext,
) -> Result<TaskEvent, EngineError> {
    let id = desired_lb.id();
    let mut state = current.clone();
    let lb = lb_mut(&mut state, &id)?;
    let api_endpoint = lb.has_api_role();
    lb.dns = desired_lb.dns.clone().map(|mut dns| {
        dns.endpoint.clear();
        dns
    });

    let mut builder = PipelineBuilder::new().stage(
        StageKind::Provisioning,
        "replace DNS",
        vec![SubPass::fatal(SubPassKind::ReconcileDns, format!("replace DNS of {id}"))],
    );
    if api_endpoint {
        builder = builder
            .stage(StageKind::Configuration, "switch API endpoint", endpoint_configuration(ctx))
            .stage(StageKind::ClusterBootstrap, "regenerate certificates", reconcile_cluster("regenerate certificates"))
            .stage(StageKind::ClusterConfiguration, "patch control plane config", control_plane_patches());
    }

    Ok(TaskEvent::new(
        EventKind::Update,
        format!("replace DNS of load balancer {id}"),
        Task { state, delta: Delta::ReplaceDns { lb: id.clone(), api_endpoint } },
        builder.build(),
        repeat_endless(),
    ))
}

fn role_pipeline(lb: &LoadBalancerCluster, firewall: bool) -> Vec<Stage> {
    let provisioning = if firewall && has_dynamic_pools(lb) {
        vec![SubPass::fatal(SubPassKind::BuildInfrastructure, "update firewall rules")]
    } else {
        Vec::new()
    };
    PipelineBuilder::new()
        .stage(StageKind::Provisioning, "update load balancer infrastructure", provisioning)
        .stage(StageKind::Configuration, "reconfigure load balancer", lb_reconcile())
        .build()
}

pub fn add_roles(
    current: &Clusters,
    desired_lb: &LoadBalancerCluster,
    roles: &[String],
) -> Result<TaskEvent, EngineError> {
    let id = desired_lb.id();
    let mut state = current.clone();
    let lb = lb_mut(&mut state, &id)?;
    for role in desired_lb.roles.iter().filter(|r| roles.contains(&r.name)) {
        lb.roles.push(role.clone());
    }
    let lb = lb.clone();

    let undo = delete_roles(&state, &id, roles)?;
    Ok(TaskEvent::new(
        EventKind::Update,
        format!("add roles {} to load balancer {id}", roles.join(", ")),
        Task { state, delta: Delta::AddRoles { lb: id.clone(), roles: roles.to_vec() } },
        role_pipeline(&lb, true),
        rollback(vec![undo]),
    ))
}

pub fn delete_roles(current: &Clusters, id: &str, roles: &[String]) -> Result<TaskEvent, EngineError> {
    let mut state = current.clone();
    let lb = lb_mut(&mut state, id)?;
    lb.roles.retain(|r| !roles.contains(&r.name));
    let lb = lb.clone();

    // listeners go first, then the firewall closes
    let mut pipeline = role_pipeline(&lb, true);
    pipeline.reverse();
    Ok(TaskEvent::new(
        EventKind::Delete,
        format!("delete roles {} from load balancer {id}", roles.join(", ")),
        Task { state, delta: Delta::DeleteRoles { lb: id.to_string(), roles: roles.to_vec() } },
        pipeline,
        repeat_endless(),
    ))
}

/// Applies setting changes of existing roles. Target pools are left alone.
pub fn reconcile_roles(
    current: &Clusters,
    desired_lb: &LoadBalancerCluster,
    internal: &[String],
    external: &[String],
) -> Result<TaskEvent, EngineError> {
    let id = desired_lb.id();
    let mut state = current.clone();
    let lb = lb_mut(&mut state, &id)?;
    for role in lb.roles.iter_mut() {
        if !internal.contains(&role.name) && !external.contains(&role.name) {
            continue;
        }
        if let Some(want) = desired_lb.role(&role.name) {
            let targets = std::mem::take(&mut role.target_pools);
            *role = want.clone();
            role.target_pools = targets;
        }
    }
    let lb = lb.clone();

    Ok(TaskEvent::new(
        EventKind::Update,
        format!("reconcile role settings of load balancer {id}"),
        Task {
            state,
            delta: Delta::ReconcileRoles { lb: id.clone(), internal: internal.to_vec(), external: external.to_vec() },
        },
        role_pipeline(&lb, !external.is_empty()),
        repeat_bounded(),
    ))
}

pub fn reconcile_target_pools(
    current: &Clusters,
    desired_lb: &LoadBalancerCluster,
    added: &BTreeMap<String, Vec<String>>,
    deleted: &BTreeMap<String, Vec<String>>,
) -> Result<TaskEvent, EngineError> {
    let id = desired_lb.id();
    let mut state = current.clone();
    let lb = lb_mut(&mut state, &id)?;
    for role in lb.roles.iter_mut() {
        if !added.contains_key(&role.name) && !deleted.contains_key(&role.name) {
            continue;
        }
        if let Some(want) = desired_lb.role(&role.name) {
            role.target_pools = want.target_pools.clone();
        }
    }

    Ok(TaskEvent::new(
        EventKind::Update,
        format!("reconcile target pools of load balancer {id}"),
        Task {
            state,
            delta: Delta::ReconcileTargetPools { lb: id.clone(), added: added.clone(), deleted: deleted.clone() },
        },
        PipelineBuilder::new()
            .stage(StageKind::Configuration, "reconfigure load balancer", lb_reconcile())
            .build(),
        repeat_bounded(),
    ))
}

/// Builds a new load balancer. It joins without the ApiServer role while the
/// endpoint lives elsewhere; the endpoint moves in a later task.
pub fn join_load_balancer(
    current: &Clusters,
    desired_lb: &LoadBalancerCluster,
    ctx: &PipelineContext,
) -> Result<TaskEvent, EngineError> {
    let id = desired_lb.id();
    let endpoint_elsewhere = current.api_load_balancer().is_some()
        || current.k8s.as_ref().is_some_and(|k| k.info.api_endpoint().is_some());

    let mut joined = desired_lb.clone();
    if endpoint_elsewhere {
        joined.roles.retain(|r| r.role_type != RoleType::ApiServer);
    }
    for node in joined.info.node_pools.iter_mut().flat_map(|p| p.nodes.iter_mut()) {
        node.status = NodeStatus::Preparing;
    }

    let mut state = current.clone();
    if state.load_balancer(&id).is_some() {
        return Err(EngineError::InvalidState(format!("load balancer {id} already exists")));
    }
    state.load_balancers.push(joined.clone());

    let mut provisioning = Vec::new();
    if has_dynamic_pools(&joined) {
        provisioning.push(SubPass::fatal(SubPassKind::BuildInfrastructure, format!("build load balancer {id}")));
    }
    if joined.dns.is_some() {
        provisioning.push(SubPass::fatal(SubPassKind::ReconcileDns, format!("create DNS for {id}")));
    }
    let pipeline = PipelineBuilder::new()
        .stage(StageKind::Provisioning, "provision load balancer", provisioning)
        .stage(StageKind::Configuration, "configure load balancer", node_configuration(ctx.proxy_enabled, true))
        .stage(
            StageKind::ClusterConfiguration,
            "record load balancer",
            vec![SubPass::fatal(SubPassKind::StoreClusterMetadata, "store cluster metadata")],
        )
        .build();

    let undo = leave_load_balancer(&state, &id, ctx)?;
    Ok(TaskEvent::new(
        EventKind::Create,
        format!("join load balancer {id}"),
        Task { state, delta: Delta::JoinLoadBalancer { lb: id.clone() } },
        pipeline,
        rollback(vec![undo]),
    ))
}

pub fn leave_load_balancer(current: &Clusters, id: &str, ctx: &PipelineContext) -> Result<TaskEvent, EngineError> {
    let mut state = current.clone();
    let lb = lb_mut(&mut state, id)?;
    mark_for_deletion(lb.info.node_pools.iter_mut().flat_map(|p| p.nodes.iter_mut()));
    let lb = lb.clone();

    let mut provisioning = Vec::new();
    if lb.dns.is_some() {
        provisioning.push(SubPass::fatal(SubPassKind::DestroyDns, format!("delete DNS of {id}")));
    }
    if has_dynamic_pools(&lb) {
        provisioning.push(SubPass::fatal(SubPassKind::DestroyInfrastructure, format!("destroy load balancer {id}")));
    }
    let mut configuration = vec![SubPass::fatal(SubPassKind::InstallVpn, "drop load balancer nodes from VPN")];
    if lb.info.has_static_pools() {
        configuration.push(SubPass::warn(SubPassKind::RemoveUtilities, "remove utilities from static nodes"));
    }
    configuration.extend(proxy_refresh(ctx.proxy_enabled));

    let pipeline = PipelineBuilder::new()
        .stage(StageKind::Provisioning, "release load balancer", provisioning)
        .stage(StageKind::Configuration, "reconfigure remaining nodes", configuration)
        .stage(
            StageKind::ClusterConfiguration,
            "record load balancer removal",
            vec![SubPass::fatal(SubPassKind::StoreClusterMetadata, "store cluster metadata")],
        )
        .build();
    Ok(TaskEvent::new(
        EventKind::Delete,
        format!("leave load balancer {id}"),
        Task { state, delta: Delta::LeaveLoadBalancer { lb: id.to_string() } },
        pipeline,
        repeat_endless(),
    ))
}

/// Adds nodes, or a whole pool when `whole_pool` is set, to a load balancer.
pub fn add_lb_nodes(
    current: &Clusters,
    id: &str,
    desired_pool: &NodePool,
    nodes: &BTreeSet<String>,
    whole_pool: bool,
    ctx: &PipelineContext,
) -> Result<TaskEvent, EngineError> {
    let mut state = current.clone();
    let lb = lb_mut(&mut state, id)?;
    let added: Vec<fleet_model::Node> = desired_pool
        .nodes
        .iter()
        .filter(|n| nodes.contains(&n.name))
        .cloned()
        .map(|mut n| {
            n.status = NodeStatus::Preparing;
            n
        })
        .collect();
    if whole_pool {
        let mut pool = desired_pool.clone();
        pool.nodes = added.clone();
        lb.info.node_pools.push(pool);
    } else {
        let pool = lb
            .info
            .pool_mut(&desired_pool.name)
            .ok_or_else(|| EngineError::InvalidState(format!("pool {} not found in {id}", desired_pool.name)))?;
        pool.nodes.extend(added.iter().cloned());
        if let (Some(d), Some(want)) = (pool.dynamic_mut(), desired_pool.dynamic()) {
            d.count = want.count;
        }
    }

    let provisioning = if desired_pool.is_dynamic() {
        vec![SubPass::fatal(SubPassKind::BuildInfrastructure, format!("build nodes for {}", desired_pool.name))]
    } else {
        Vec::new()
    };
    let pipeline = PipelineBuilder::new()
        .stage(StageKind::Provisioning, "provision load balancer nodes", provisioning)
        .stage(StageKind::Configuration, "configure load balancer nodes", node_configuration(ctx.proxy_enabled, true))
        .build();

    let undo = delete_lb_nodes(&state, id, &desired_pool.name, nodes, whole_pool, ctx)?;
    let names: Vec<String> = added.iter().map(|n| n.name.clone()).collect();
    Ok(TaskEvent::new(
        EventKind::Update,
        format!("add {} nodes to load balancer {id} pool {}", names.len(), desired_pool.name),
        Task {
            state,
            delta: Delta::AddLbNodes { lb: id.to_string(), pool: desired_pool.name.clone(), nodes: names, whole_pool },
        },
        pipeline,
        rollback(vec![undo]),
    ))
}

pub fn delete_lb_nodes(
    current: &Clusters,
    id: &str,
    pool_name: &str,
    nodes: &BTreeSet<String>,
    whole_pool: bool,
    ctx: &PipelineContext,
) -> Result<TaskEvent, EngineError> {
    let mut state = current.clone();
    let lb = lb_mut(&mut state, id)?;
    let pool = lb
        .info
        .pool_mut(pool_name)
        .ok_or_else(|| EngineError::InvalidState(format!("pool {pool_name} not found in {id}")))?;
    mark_for_deletion(pool.nodes.iter_mut().filter(|n| whole_pool || nodes.contains(&n.name)));
    let pool = pool.clone();

    let mut configuration = lb_reconcile();
    if pool.is_static() {
        configuration.push(SubPass::warn(SubPassKind::RemoveUtilities, "remove utilities from static nodes"));
    }
    configuration.extend(proxy_refresh(ctx.proxy_enabled));
    let provisioning = if pool.is_dynamic() {
        vec![SubPass::fatal(SubPassKind::DestroyInfrastructure, format!("destroy nodes of {pool_name}"))]
    } else {
        Vec::new()
    };
    let pipeline = PipelineBuilder::new()
        .stage(StageKind::Configuration, "reconfigure load balancer", configuration)
        .stage(StageKind::Provisioning, "release load balancer nodes", provisioning)
        .build();

    let names: Vec<String> = pool
        .nodes
        .iter()
        .filter(|n| n.is_marked_for_deletion())
        .map(|n| n.name.clone())
        .collect();
    Ok(TaskEvent::new(
        EventKind::Delete,
        format!("delete {} nodes from load balancer {id} pool {pool_name}", names.len()),
        Task {
            state,
            delta: Delta::DeleteLbNodes { lb: id.to_string(), pool: pool_name.to_string(), nodes: names, whole_pool },
        },
        pipeline,
        repeat_endless(),
    ))
}
