//! Task dispatch
//!
//! Workers pull the head of a cluster's task queue under a lease, refresh
//! the lease while they work and report the outcome. At most one task per
//! cluster is in flight. A task whose lease runs out goes back to the head
//! of the queue under a fresh id.

use crate::backoff::{FibonacciBackoff, MAX_BACKOFF_TICKS, MIN_BACKOFF_TICKS};
use crate::error::DispatchError;
use chrono::{DateTime, Duration, Utc};
use fleet_model::{ClusterState, Clusters, Lease, OnError, TaskEvent, WorkflowStatus};
use tracing::{debug, info, warn};

fn in_flight_mut<'a>(state: &'a mut ClusterState, task_id: &str) -> Result<&'a mut TaskEvent, DispatchError> {
    let task = state.in_flight.as_mut().ok_or(DispatchError::NothingInFlight)?;
    if task.id != task_id {
        return Err(DispatchError::UnknownTask { expected: task.id.clone(), got: task_id.to_string() });
    }
    Ok(task)
}

/// Hands out the head of the queue, unless a task is already in flight.
pub fn pull_next(state: &mut ClusterState, now: DateTime<Utc>, lease: Duration) -> Option<TaskEvent> {
    if state.in_flight.is_some() {
        return None;
    }
    let mut task = state.events.pop_front()?;
    task.lease = Some(Lease { expires_at: now + lease });
    state.in_flight = Some(task.clone());
    state.state.status = WorkflowStatus::InProgress;
    state.state.description = task.description.clone();
    debug!("Leased task {} ({})", task.id, task.description);
    Some(task)
}

pub fn refresh_lease(
    state: &mut ClusterState,
    task_id: &str,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<(), DispatchError> {
    let task = in_flight_mut(state, task_id)?;
    task.lease = Some(Lease { expires_at: now + lease });
    Ok(())
}

/// Requeues the in-flight task when its lease has run out. Returns whether
/// anything was requeued.
pub fn expire_lease(state: &mut ClusterState, now: DateTime<Utc>) -> bool {
    let expired = state
        .in_flight
        .as_ref()
        .and_then(|t| t.lease.as_ref())
        .is_some_and(|lease| lease.expires_at <= now);
    if !expired {
        return false;
    }
    let Some(task) = state.in_flight.take() else {
        return false;
    };
    let again = task.reissue();
    warn!("Lease of task {} expired, requeued as {}", task.id, again.id);
    state.events.push_front(again);
    state.state.status = WorkflowStatus::WaitForPickup;
    state.state.description = format!("lease of {} expired", task.description);
    true
}

/// Records a successful run: `reported` becomes the current snapshot and a
/// displaced lower-priority task goes back to the head of the queue.
pub fn report_success(state: &mut ClusterState, task_id: &str, reported: Clusters) -> Result<(), DispatchError> {
    in_flight_mut(state, task_id)?;
    let Some(done) = state.in_flight.take() else {
        return Err(DispatchError::NothingInFlight);
    };
    state.current = reported;
    if let Some(next) = done.lower_priority {
        debug!("Requeueing displaced task {}", next.description);
        state.events.push_front(next.reissue());
    }
    state.state.status = if state.events.is_empty() { WorkflowStatus::Done } else { WorkflowStatus::WaitForPickup };
    state.state.description = done.description;
    info!("Task {} succeeded", task_id);
    Ok(())
}

/// Records a failed run. The queue is dropped: it was computed against a
/// state the failure invalidated. Repeatable tasks are throttled with a
/// Fibonacci backoff measured in ticks.
pub fn report_failure(state: &mut ClusterState, task_id: &str, description: &str) -> Result<(), DispatchError> {
    let task = in_flight_mut(state, task_id)?;
    task.lease = None;
    if let OnError::Repeat(policy) = &mut task.on_error {
        policy.wait_ticks = FibonacciBackoff::ticks_for_attempt(policy.attempts, MIN_BACKOFF_TICKS, MAX_BACKOFF_TICKS);
    }
    warn!("Task {} failed: {}", task_id, description);
    state.events.clear();
    state.state.status = WorkflowStatus::Error;
    state.state.description = description.to_string();
    Ok(())
}
