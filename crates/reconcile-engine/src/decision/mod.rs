//! Reconciliation decisions
//!
//! [`Reconciler::decide`] looks at one cluster's state and picks exactly
//! one branch: nothing to do, remove the entry, schedule tasks, keep
//! backing off, or report the cluster as blocked. [`apply`] writes the
//! decision back into the state; persisting it is the caller's job.

mod retry;
mod update;

use crate::error::EngineError;
use crate::health::HealthOracle;
use crate::identity::IdentityGenerator;
use crate::metrics::{DecisionOutcome, MetricsSink};
use crate::pipeline;
use crate::projection::transfer_identity;
use fleet_model::{ClusterState, Clusters, OnError, RepeatPolicy, TaskEvent, WorkflowStatus};
use retry::FailedTask;
use std::sync::Arc;
use tracing::{error, info};

/// Tasks to enqueue, plus the rewrites of the state that go with them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub reason: String,
    /// Appended to the queue in order
    pub tasks: Vec<TaskEvent>,
    /// Replacement desired snapshot (identity transfer, rolling update)
    pub desired: Option<Clusters>,
    /// Drop the failed or stale in-flight task
    pub clears_in_flight: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    NoOp,
    /// Nothing exists, nothing is wanted: drop the cluster entry
    Remove,
    Schedule(Plan),
    /// The failed task is still throttled
    Backoff(RepeatPolicy),
    /// Only an operator can move the cluster forward
    Blocked(String),
}

impl Decision {
    pub fn tasks(&self) -> &[TaskEvent] {
        match self {
            Decision::Schedule(plan) => &plan.tasks,
            _ => &[],
        }
    }
}

#[derive(Clone)]
pub struct Reconciler {
    oracle: Arc<dyn HealthOracle>,
    identity: Arc<dyn IdentityGenerator>,
    metrics: Arc<dyn MetricsSink>,
}

impl Reconciler {
    pub fn new(
        oracle: Arc<dyn HealthOracle>,
        identity: Arc<dyn IdentityGenerator>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self { oracle, identity, metrics }
    }

    /// One decision for `cluster`. Errors an operator must resolve come back
    /// as [`Decision::Blocked`]; anything else is returned as an error and
    /// the tick should be retried.
    pub async fn decide(&self, cluster: &str, state: &ClusterState) -> Result<Decision, EngineError> {
        let (outcome, decision) = match self.branch(cluster, state).await {
            Ok(picked) => picked,
            Err(e) if e.is_blocking() => {
                error!("Cluster {} is blocked: {}", cluster, e);
                (DecisionOutcome::Blocked, Decision::Blocked(e.to_string()))
            }
            Err(e) => return Err(e),
        };

        self.metrics.decision(cluster, outcome);
        for task in decision.tasks() {
            self.metrics.task_scheduled(cluster, task.kind);
        }
        match &decision {
            Decision::NoOp => {}
            Decision::Schedule(plan) => {
                info!("Cluster {}: {} ({} tasks)", cluster, plan.reason, plan.tasks.len());
            }
            _ => info!("Cluster {}: {}", cluster, outcome.as_str()),
        }
        Ok(decision)
    }

    async fn branch(&self, cluster: &str, state: &ClusterState) -> Result<(DecisionOutcome, Decision), EngineError> {
        if state.is_in_flight_executing() || !state.events.is_empty() {
            return Ok((DecisionOutcome::NoOp, Decision::NoOp));
        }
        if let Some(FailedTask::Wait(policy)) = state.in_flight.as_ref().map(retry::handle_failed) {
            return Ok((DecisionOutcome::Backoff, Decision::Backoff(policy)));
        }
        if state.is_removable() {
            return Ok((DecisionOutcome::Remove, Decision::Remove));
        }
        if state.desired.is_empty() {
            return Ok((DecisionOutcome::Destroy, Decision::Schedule(destroy(state))));
        }
        if state.current.is_empty() {
            return Ok((DecisionOutcome::Create, Decision::Schedule(create(state)?)));
        }
        self.update(cluster, state).await
    }
}

fn rewrite(state: &ClusterState, desired: Clusters) -> Option<Clusters> {
    (desired != state.desired).then_some(desired)
}

/// Builds the cluster from scratch. A stale in-flight task (a create that
/// failed half-way, or one whose worker vanished) is cleaned up first, so
/// two creates of the same cluster never run.
fn create(state: &ClusterState) -> Result<Plan, EngineError> {
    let desired = transfer_identity(&state.current, &state.desired);
    let create = pipeline::create(&desired)?;
    let (reason, tasks) = match &state.in_flight {
        Some(stale) => {
            let fragment = pipeline::union(&state.current, &stale.task.state);
            if fragment.is_empty() {
                ("create cluster".to_string(), vec![create])
            } else {
                ("destroy partial cluster, then create".to_string(), vec![pipeline::destroy(&fragment), create])
            }
        }
        None => ("create cluster".to_string(), vec![create]),
    };
    Ok(Plan {
        reason,
        tasks,
        desired: rewrite(state, desired),
        clears_in_flight: state.in_flight.is_some(),
    })
}

/// Destroys whatever exists, including what a stale in-flight task may
/// have built.
fn destroy(state: &ClusterState) -> Plan {
    let target = match &state.in_flight {
        Some(stale) => pipeline::union(&state.current, &stale.task.state),
        None => state.current.clone(),
    };
    let tasks = if target.is_empty() { Vec::new() } else { vec![pipeline::destroy(&target)] };
    Plan {
        reason: "destroy cluster".to_string(),
        tasks,
        desired: None,
        clears_in_flight: state.in_flight.is_some(),
    }
}

/// Writes `decision` into `state`. Returns whether the state changed.
pub fn apply(decision: &Decision, state: &mut ClusterState) -> bool {
    match decision {
        Decision::NoOp | Decision::Remove => false,
        Decision::Schedule(plan) => {
            if plan.clears_in_flight {
                state.in_flight = None;
            }
            if let Some(desired) = &plan.desired {
                state.desired = desired.clone();
            }
            state.events.extend(plan.tasks.iter().cloned());
            state.state.status = if state.events.is_empty() { WorkflowStatus::Done } else { WorkflowStatus::WaitForPickup };
            state.state.description = plan.reason.clone();
            true
        }
        Decision::Backoff(policy) => match state.in_flight.as_mut() {
            Some(task) => {
                task.on_error = OnError::Repeat(policy.clone());
                true
            }
            None => false,
        },
        Decision::Blocked(reason) => {
            let changed = state.state.status != WorkflowStatus::Error || state.state.description != *reason;
            state.state.status = WorkflowStatus::Error;
            state.state.description = reason.clone();
            changed
        }
    }
}
