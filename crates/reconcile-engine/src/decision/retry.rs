//! Handling of a failed in-flight task

use crate::pipeline::repeat_endless;
use fleet_model::{OnError, RepeatPolicy, TaskEvent};

/// What the decision loop does with a task that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FailedTask {
    /// Still throttled; wait one more tick
    Wait(RepeatPolicy),
    /// Run the same task again under a fresh id
    Retry(TaskEvent),
    /// Undo the partial application
    Rollback(Vec<TaskEvent>),
    /// Drop it and let a fresh diff decide
    GiveUp,
}

pub(crate) fn handle_failed(task: &TaskEvent) -> FailedTask {
    match &task.on_error {
        OnError::Repeat(policy) if policy.wait_ticks > 0 => {
            FailedTask::Wait(RepeatPolicy { wait_ticks: policy.wait_ticks - 1, ..policy.clone() })
        }
        OnError::Repeat(policy) if policy.exhausted() && !task.is_non_reversible() => FailedTask::GiveUp,
        OnError::Repeat(policy) => {
            let mut again = task.reissue();
            again.on_error = OnError::Repeat(RepeatPolicy { attempts: policy.attempts + 1, wait_ticks: 0, ..policy.clone() });
            FailedTask::Retry(again)
        }
        // Non-reversible deltas are never rolled back, only retried.
        OnError::Rollback { .. } | OnError::None if task.is_non_reversible() => {
            let mut again = task.reissue();
            again.on_error = repeat_endless();
            FailedTask::Retry(again)
        }
        OnError::Rollback { tasks } => FailedTask::Rollback(tasks.iter().map(TaskEvent::reissue).collect()),
        OnError::None => FailedTask::GiveUp,
    }
}
