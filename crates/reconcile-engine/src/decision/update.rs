//! Incremental updates of an existing cluster
//!
//! Changes are taken one layer at a time and only the first layer with
//! work produces tasks:
//!
//! 1. load-balancer fixes that do not need new cluster nodes
//! 2. Kubernetes node changes
//! 3. load-balancer changes that need the new nodes (joins, leaves)
//! 4. VPN mesh drift
//! 5. cosmetic cluster changes (version, proxy, autoscaler, metadata)
//!
//! Unreachable nodes preempt all of it. Their remediation runs first and
//! carries the work it displaced as a lower-priority task.

use super::retry::{self, FailedTask};
use super::{Decision, Plan, Reconciler, rewrite};
use crate::diff::{KubernetesDiff, LoadBalancersDiff, kubernetes_diff, load_balancers_diff};
use crate::error::EngineError;
use crate::health::{HealthReport, vpn_drift};
use crate::metrics::DecisionOutcome;
use crate::pipeline::{self, PipelineContext};
use crate::projection::transfer_identity;
use crate::rolling::plan_rolling_update;
use crate::unreachable;
use fleet_model::{ApiEndpointChange, ClusterState, Clusters, TaskEvent, WorkflowStatus};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Work picked by one layer.
#[derive(Debug)]
struct Step {
    reason: String,
    tasks: Vec<TaskEvent>,
    desired: Option<Clusters>,
}

impl Step {
    fn single(reason: impl Into<String>, task: TaskEvent) -> Self {
        Self { reason: reason.into(), tasks: vec![task], desired: None }
    }
}

/// `[a, b, c]` becomes `a` with `b` displaced, `b` with `c` displaced.
fn chain(tasks: Vec<TaskEvent>) -> Option<TaskEvent> {
    tasks.into_iter().rev().reduce(|next, task| task.with_lower_priority(next))
}

impl Reconciler {
    pub(super) async fn update(
        &self,
        cluster: &str,
        state: &ClusterState,
    ) -> Result<(DecisionOutcome, Decision), EngineError> {
        let current = &state.current;
        let desired = transfer_identity(current, &state.desired);
        let ctx = PipelineContext::new(current, &desired);
        let mut rewritten = rewrite(state, desired.clone());

        let mut outcome = DecisionOutcome::Update;
        let mut reason = String::new();
        let mut intended = Vec::new();
        let clears_in_flight = state.in_flight.is_some();
        if let Some(failed) = &state.in_flight {
            match retry::handle_failed(failed) {
                FailedTask::Retry(again) => {
                    outcome = DecisionOutcome::Retry;
                    reason = format!("retry {}", failed.description);
                    intended.push(again);
                }
                FailedTask::Rollback(undo) => {
                    outcome = DecisionOutcome::Rollback;
                    reason = format!("roll back {}", failed.description);
                    intended = undo;
                }
                FailedTask::GiveUp => warn!("Giving up on {}, recomputing from the diff", failed.description),
                FailedTask::Wait(_) => {}
            }
        }

        let report = HealthReport::collect(self.oracle.as_ref(), current).await?;
        self.metrics.unreachable_nodes(cluster, report.count());

        if intended.is_empty() {
            let step = if report.is_empty() {
                self.next_step(current, &desired, &ctx).await?
            } else {
                // Remediation runs even when the diff cannot be computed.
                self.next_step(current, &desired, &ctx).await.unwrap_or_else(|e| {
                    warn!("Cluster {}: diff skipped while nodes are unreachable: {}", cluster, e);
                    None
                })
            };
            if let Some(step) = step {
                reason = step.reason;
                intended = step.tasks;
                if step.desired.is_some() {
                    rewritten = step.desired;
                }
            }
        }

        if !report.is_empty() {
            let fix = unreachable::remediate(self.oracle.as_ref(), current, &desired, &report, &ctx).await?;
            let task = match chain(intended) {
                Some(displaced) => fix.with_lower_priority(displaced),
                None => fix,
            };
            let plan = Plan {
                reason: format!("remediate {} unreachable nodes", report.count()),
                tasks: vec![task],
                desired: rewritten,
                clears_in_flight,
            };
            return Ok((DecisionOutcome::Update, Decision::Schedule(plan)));
        }

        if intended.is_empty() {
            let settled = !clears_in_flight && rewritten.is_none() && state.state.status == WorkflowStatus::Done;
            if settled {
                return Ok((DecisionOutcome::NoOp, Decision::NoOp));
            }
            let plan = Plan {
                reason: "cluster is up to date".to_string(),
                tasks: Vec::new(),
                desired: rewritten,
                clears_in_flight,
            };
            return Ok((DecisionOutcome::NoOp, Decision::Schedule(plan)));
        }

        let plan = Plan { reason, tasks: intended, desired: rewritten, clears_in_flight };
        Ok((outcome, Decision::Schedule(plan)))
    }

    async fn next_step(
        &self,
        current: &Clusters,
        desired: &Clusters,
        ctx: &PipelineContext,
    ) -> Result<Option<Step>, EngineError> {
        let (Some(cur_k8s), Some(des_k8s)) = (current.k8s.as_ref(), desired.k8s.as_ref()) else {
            return Err(EngineError::InvalidState("update without a Kubernetes cluster".to_string()));
        };
        let k8s = kubernetes_diff(cur_k8s, des_k8s)?;
        let lbs = load_balancers_diff(&current.load_balancers, &desired.load_balancers);

        if let Some(step) = load_balancers_before_nodes(current, desired, &lbs, ctx)? {
            return Ok(Some(step));
        }
        if let Some(step) = self.kubernetes_nodes(current, desired, &k8s, ctx)? {
            return Ok(Some(step));
        }
        if let Some(step) = load_balancers_after_nodes(current, &lbs, ctx)? {
            return Ok(Some(step));
        }
        if let Some(drift) = vpn_drift(self.oracle.as_ref(), current).await {
            let reason = format!("VPN mesh drift ({} of {} peers)", drift.observed, drift.expected);
            return Ok(Some(Step::single(reason, pipeline::vpn_refresh(current, drift))));
        }
        cosmetic(current, &k8s)
    }

    fn kubernetes_nodes(
        &self,
        current: &Clusters,
        desired: &Clusters,
        k8s: &KubernetesDiff<'_>,
        ctx: &PipelineContext,
    ) -> Result<Option<Step>, EngineError> {
        if let Some((pool, nodes)) = k8s.pending_deletions.iter().next() {
            let task = pipeline::delete_nodes(current, pool, nodes, false, ctx)?;
            return Ok(Some(Step::single(format!("finish deletion in pool {pool}"), task)));
        }

        if k8s.api_endpoint.needs_move() {
            if let (Some(from), Some(to)) = (&k8s.api_endpoint.current, &k8s.api_endpoint.desired) {
                let task = pipeline::move_api_endpoint(current, from, to, ctx)?;
                return Ok(Some(Step::single("move API endpoint off deleted nodes", task)));
            }
        }

        if let Some(update) = k8s.rolling_updates.first() {
            let plan = plan_rolling_update(current, desired, update, self.identity.as_ref(), ctx)?;
            return Ok(Some(Step {
                reason: format!("rolling update of pool {} onto {}", update.pool, plan.sibling),
                tasks: plan.tasks,
                desired: Some(plan.desired),
            }));
        }

        for pool in k8s.dynamic.added.keys().chain(k8s.static_.added.keys()) {
            if let Some(want) = k8s.desired_pool(pool) {
                let task = pipeline::add_pool(current, want, ctx)?;
                return Ok(Some(Step::single(format!("add pool {pool}"), task)));
            }
        }
        for (pool, nodes) in k8s.dynamic.partially_added.iter().chain(k8s.static_.partially_added.iter()) {
            if let Some(want) = k8s.desired_pool(pool) {
                let task = pipeline::add_nodes(current, want, nodes, ctx)?;
                return Ok(Some(Step::single(format!("add nodes to pool {pool}"), task)));
            }
        }

        let endpoint_pool = k8s.api_endpoint.current.as_ref().map(|r| r.pool.as_str());
        let held = |pool: &str| k8s.api_endpoint.pending && endpoint_pool == Some(pool);
        let control_pools: BTreeSet<&str> = k8s.current.info.control_pools().map(|p| p.name.as_str()).collect();
        for pool in k8s.dynamic.deleted.keys().chain(k8s.static_.deleted.keys()) {
            if held(pool.as_str()) {
                debug!("Deletion of pool {} waits for a new control pool", pool);
                continue;
            }
            let last_control = control_pools.contains(pool.as_str())
                && control_pools.iter().all(|p| *p == pool.as_str() || k8s.deletes_pool(p));
            if last_control {
                debug!("Pool {} is the last control pool, deleting it waits", pool);
                continue;
            }
            let task = pipeline::delete_pool(current, pool, false, ctx)?;
            return Ok(Some(Step::single(format!("delete pool {pool}"), task)));
        }
        for (pool, nodes) in k8s.dynamic.partially_deleted.iter().chain(k8s.static_.partially_deleted.iter()) {
            if held(pool.as_str()) {
                continue;
            }
            let task = pipeline::delete_nodes(current, pool, nodes, false, ctx)?;
            return Ok(Some(Step::single(format!("delete nodes from pool {pool}"), task)));
        }
        Ok(None)
    }
}

fn pools_exist(current: &Clusters, pools: &[String]) -> bool {
    current.k8s.as_ref().is_some_and(|k| pools.iter().all(|p| k.info.pool(p).is_some()))
}

/// Roles of `desired_lb` in `names` whose target pools all exist already.
fn ready_roles(current: &Clusters, desired_lb: &fleet_model::LoadBalancerCluster, names: &[String]) -> (Vec<String>, Vec<String>) {
    names.iter().cloned().partition(|name| {
        desired_lb.role(name).is_some_and(|r| pools_exist(current, &r.target_pools))
    })
}

fn ready_targets(
    current: &Clusters,
    added: &BTreeMap<String, Vec<String>>,
) -> (BTreeMap<String, Vec<String>>, BTreeMap<String, Vec<String>>) {
    added.clone().into_iter().partition(|(_, pools)| pools_exist(current, pools))
}

fn load_balancers_before_nodes(
    current: &Clusters,
    desired: &Clusters,
    lbs: &LoadBalancersDiff<'_>,
    ctx: &PipelineContext,
) -> Result<Option<Step>, EngineError> {
    let endpoint_step = match &lbs.api_endpoint {
        ApiEndpointChange::NoChange => None,
        ApiEndpointChange::AttachingLoadBalancer { desired: id } | ApiEndpointChange::MoveEndpoint { desired: id, .. }
            if current.load_balancer(id).is_none() =>
        {
            None
        }
        ApiEndpointChange::EndpointRenamed { id } => {
            let desired_lb = desired
                .load_balancer(id)
                .ok_or_else(|| EngineError::InvalidState(format!("load balancer {id} not desired")))?;
            Some(Step::single(format!("rename API endpoint of {id}"), pipeline::replace_dns(current, desired_lb, ctx)?))
        }
        change => Some(Step::single(
            "move API endpoint between nodes and load balancers",
            pipeline::lb_api_endpoint(current, desired, change, ctx)?,
        )),
    };
    if endpoint_step.is_some() {
        return Ok(endpoint_step);
    }

    for m in &lbs.modified {
        let id = &m.current.id;
        let desired_lb = lbs.desired(&m.desired);

        if let Some((pool, nodes)) = m.pending_deletions.iter().next() {
            let task = pipeline::delete_lb_nodes(current, id, pool, nodes, false, ctx)?;
            return Ok(Some(Step::single(format!("finish deletion in {id}/{pool}"), task)));
        }
        if m.dns_changed {
            return Ok(Some(Step::single(format!("replace DNS of {id}"), pipeline::replace_dns(current, desired_lb, ctx)?)));
        }
        for (pool, nodes) in m.dynamic.added.iter().chain(m.static_.added.iter()) {
            if let Some(want) = desired_lb.info.pool(pool) {
                let task = pipeline::add_lb_nodes(current, id, want, nodes, true, ctx)?;
                return Ok(Some(Step::single(format!("add pool {pool} to {id}"), task)));
            }
        }
        for (pool, nodes) in m.dynamic.partially_added.iter().chain(m.static_.partially_added.iter()) {
            if let Some(want) = desired_lb.info.pool(pool) {
                let task = pipeline::add_lb_nodes(current, id, want, nodes, false, ctx)?;
                return Ok(Some(Step::single(format!("add nodes to {id}/{pool}"), task)));
            }
        }
        if !m.roles_deleted.is_empty() {
            let task = pipeline::delete_roles(current, id, &m.roles_deleted)?;
            return Ok(Some(Step::single(format!("delete roles of {id}"), task)));
        }
        if !m.internal_settings.is_empty() || !m.external_settings.is_empty() {
            let task = pipeline::reconcile_roles(current, desired_lb, &m.internal_settings, &m.external_settings)?;
            return Ok(Some(Step::single(format!("reconcile role settings of {id}"), task)));
        }
        let (roles, _) = ready_roles(current, desired_lb, &m.roles_added);
        if !roles.is_empty() {
            let task = pipeline::add_roles(current, desired_lb, &roles)?;
            return Ok(Some(Step::single(format!("add roles to {id}"), task)));
        }
        let (added, _) = ready_targets(current, &m.target_pools_added);
        if !added.is_empty() || !m.target_pools_deleted.is_empty() {
            let task = pipeline::reconcile_target_pools(current, desired_lb, &added, &m.target_pools_deleted)?;
            return Ok(Some(Step::single(format!("reconcile target pools of {id}"), task)));
        }
        if let Some((pool, nodes)) = m.dynamic.deleted.iter().chain(m.static_.deleted.iter()).next() {
            let task = pipeline::delete_lb_nodes(current, id, pool, nodes, true, ctx)?;
            return Ok(Some(Step::single(format!("delete pool {pool} from {id}"), task)));
        }
        if let Some((pool, nodes)) = m.dynamic.partially_deleted.iter().chain(m.static_.partially_deleted.iter()).next() {
            let task = pipeline::delete_lb_nodes(current, id, pool, nodes, false, ctx)?;
            return Ok(Some(Step::single(format!("delete nodes from {id}/{pool}"), task)));
        }
    }
    Ok(None)
}

fn load_balancers_after_nodes(
    current: &Clusters,
    lbs: &LoadBalancersDiff<'_>,
    ctx: &PipelineContext,
) -> Result<Option<Step>, EngineError> {
    if let Some(index) = lbs.added.first() {
        let task = pipeline::join_load_balancer(current, lbs.desired(index), ctx)?;
        return Ok(Some(Step::single(format!("join load balancer {}", index.id), task)));
    }

    for m in &lbs.modified {
        let desired_lb = lbs.desired(&m.desired);
        let (_, roles) = ready_roles(current, desired_lb, &m.roles_added);
        if !roles.is_empty() {
            let task = pipeline::add_roles(current, desired_lb, &roles)?;
            return Ok(Some(Step::single(format!("add roles to {}", m.current.id), task)));
        }
        let (_, added) = ready_targets(current, &m.target_pools_added);
        if !added.is_empty() {
            let task = pipeline::reconcile_target_pools(current, desired_lb, &added, &BTreeMap::new())?;
            return Ok(Some(Step::single(format!("reconcile target pools of {}", m.current.id), task)));
        }
    }

    for index in &lbs.deleted {
        if lbs.current(index).has_api_role() && lbs.api_endpoint != ApiEndpointChange::NoChange {
            debug!("Load balancer {} still serves the API endpoint", index.id);
            continue;
        }
        let task = pipeline::leave_load_balancer(current, &index.id, ctx)?;
        return Ok(Some(Step::single(format!("leave load balancer {}", index.id), task)));
    }
    Ok(None)
}

fn cosmetic(current: &Clusters, k8s: &KubernetesDiff<'_>) -> Result<Option<Step>, EngineError> {
    let desired = k8s.desired;
    if k8s.version_changed {
        let task = pipeline::upgrade_version(current, &desired.kubernetes_version)?;
        return Ok(Some(Step::single(format!("upgrade Kubernetes to {}", desired.kubernetes_version), task)));
    }
    if k8s.proxy != fleet_model::ProxyTransition::NoChange {
        let task = pipeline::toggle_proxy(current, desired.proxy.as_ref(), k8s.proxy)?;
        return Ok(Some(Step::single("reconcile proxy settings", task)));
    }
    if !k8s.autoscaler_gained.is_empty() || !k8s.autoscaler_lost.is_empty() {
        let task = pipeline::autoscaler(current, desired, &k8s.autoscaler_gained, &k8s.autoscaler_lost)?;
        return Ok(Some(Step::single("reconcile autoscaler", task)));
    }
    if !k8s.metadata.is_empty() {
        let task = pipeline::patch_nodes(current, desired, &k8s.metadata)?;
        return Ok(Some(Step::single("patch node metadata", task)));
    }
    Ok(None)
}
