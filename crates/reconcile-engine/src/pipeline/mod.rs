//! Task pipeline builder
//!
//! One builder per delta class. Each returns a finished [`TaskEvent`]: a
//! deep copy of the state the workers converge to, the typed delta and the
//! ordered stages. Builders are pure; nothing they return aliases their
//! inputs.

mod kubernetes;
mod lifecycle;
mod loadbalancers;

pub use kubernetes::*;
pub use lifecycle::*;
pub use loadbalancers::*;

use crate::error::EngineError;
use fleet_model::{
    Clusters, K8sCluster, LoadBalancerCluster, NodeStatus, OnError, RepeatPolicy, Stage, StageKind, SubPass,
    SubPassKind, TaskEvent,
};
use std::collections::BTreeSet;

/// Attempts granted to tasks with a bounded repeat policy.
pub const BOUNDED_ATTEMPTS: u32 = 5;

/// Facts about the current cluster that shape every pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineContext {
    /// Nodes route egress through a proxy
    pub proxy_enabled: bool,
    /// At least one control node is running
    pub api_server_active: bool,
    /// Pools referenced by a load-balancer role in either snapshot
    pub lb_target_pools: BTreeSet<String>,
}

impl PipelineContext {
    pub fn new(current: &Clusters, desired: &Clusters) -> Self {
        let lb_target_pools = current
            .load_balancers
            .iter()
            .chain(desired.load_balancers.iter())
            .flat_map(|lb| lb.roles.iter())
            .flat_map(|role| role.target_pools.iter().cloned())
            .collect();
        Self {
            proxy_enabled: current.k8s.as_ref().is_some_and(K8sCluster::proxy_enabled),
            api_server_active: current.k8s.as_ref().is_some_and(K8sCluster::api_server_active),
            lb_target_pools,
        }
    }

    /// Whether changes to `pool` require the load balancers to be reconciled.
    pub fn targets(&self, pool: &str, state: &Clusters) -> bool {
        self.lb_target_pools.contains(pool) || state.pool_targeted_by_load_balancer(pool)
    }
}

/// Ordered stage list. Stages without sub-passes are skipped.
#[derive(Debug, Default)]
pub(crate) struct PipelineBuilder {
    stages: Vec<Stage>,
}

impl PipelineBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn stage(mut self, kind: StageKind, about: impl Into<String>, sub_passes: Vec<SubPass>) -> Self {
        if !sub_passes.is_empty() {
            self.stages.push(Stage::new(kind, about, sub_passes));
        }
        self
    }

    pub(crate) fn build(self) -> Vec<Stage> {
        self.stages
    }
}

/// Node preparation. Under a proxy the VPN pass is bracketed by proxy-env
/// updates: update, act, update, commit.
pub(crate) fn node_configuration(proxy_enabled: bool, reconcile_lbs: bool) -> Vec<SubPass> {
    let mut passes = Vec::new();
    if proxy_enabled {
        passes.push(SubPass::fatal(SubPassKind::UpdateProxyEnvs, "set proxy envs for new nodes"));
    }
    passes.push(SubPass::fatal(SubPassKind::InstallNodeRequirements, "install node requirements"));
    passes.push(SubPass::fatal(SubPassKind::InstallVpn, "install VPN mesh"));
    if proxy_enabled {
        passes.push(SubPass::fatal(SubPassKind::UpdateProxyEnvs, "refresh no-proxy list with VPN addresses"));
        passes.push(SubPass::fatal(SubPassKind::CommitProxyEnvs, "commit proxy envs"));
    }
    if reconcile_lbs {
        passes.push(SubPass::fatal(SubPassKind::ReconcileLoadBalancers, "reconcile load balancers"));
    }
    passes
}

pub(crate) fn proxy_refresh(proxy_enabled: bool) -> Vec<SubPass> {
    if proxy_enabled {
        vec![
            SubPass::fatal(SubPassKind::UpdateProxyEnvs, "update proxy envs"),
            SubPass::fatal(SubPassKind::CommitProxyEnvs, "commit proxy envs"),
        ]
    } else {
        Vec::new()
    }
}

/// Certificate and config-map patches after the control plane changed.
pub(crate) fn control_plane_patches() -> Vec<SubPass> {
    vec![
        SubPass::fatal(SubPassKind::PatchKubeadmConfigMap, "patch kubeadm config map"),
        SubPass::fatal(SubPassKind::PatchClusterInfoConfigMap, "patch cluster-info config map"),
        SubPass::fatal(SubPassKind::PatchKubeProxyConfigMap, "patch kube-proxy config map"),
        SubPass::warn(SubPassKind::RestartNetworkPlugin, "restart network plugin"),
    ]
}

pub(crate) fn reconcile_cluster(about: &str) -> Vec<SubPass> {
    vec![SubPass::fatal(SubPassKind::ReconcileCluster, about)]
}

pub fn repeat_endless() -> OnError {
    OnError::Repeat(RepeatPolicy::endless())
}

pub fn repeat_bounded() -> OnError {
    OnError::Repeat(RepeatPolicy::bounded(BOUNDED_ATTEMPTS))
}

pub fn rollback(tasks: Vec<TaskEvent>) -> OnError {
    OnError::Rollback { tasks }
}

pub(crate) fn k8s_mut(state: &mut Clusters) -> Result<&mut K8sCluster, EngineError> {
    state
        .k8s
        .as_mut()
        .ok_or_else(|| EngineError::InvalidState("snapshot has no kubernetes cluster".to_string()))
}

pub(crate) fn lb_mut<'a>(state: &'a mut Clusters, id: &str) -> Result<&'a mut LoadBalancerCluster, EngineError> {
    state
        .load_balancer_mut(id)
        .ok_or_else(|| EngineError::InvalidState(format!("load balancer {id} not found")))
}

pub(crate) fn mark_for_deletion<'a>(nodes: impl Iterator<Item = &'a mut fleet_model::Node>) {
    for node in nodes {
        node.status = NodeStatus::MarkedForDeletion;
    }
}
