//! Metrics sink
//!
//! The engine reports what it decided through an injected sink instead of
//! global counters. The controller plugs in a Prometheus-backed sink; tests
//! and library users get [`NoopMetrics`].

use fleet_model::EventKind;

/// Branch the decision loop took for one cluster on one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionOutcome {
    NoOp,
    Remove,
    Create,
    Destroy,
    Update,
    Retry,
    Rollback,
    Backoff,
    Blocked,
}

impl DecisionOutcome {
    /// Label value used by metric backends
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::NoOp => "noop",
            DecisionOutcome::Remove => "remove",
            DecisionOutcome::Create => "create",
            DecisionOutcome::Destroy => "destroy",
            DecisionOutcome::Update => "update",
            DecisionOutcome::Retry => "retry",
            DecisionOutcome::Rollback => "rollback",
            DecisionOutcome::Backoff => "backoff",
            DecisionOutcome::Blocked => "blocked",
        }
    }
}

pub fn event_kind_label(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Create => "create",
        EventKind::Update => "update",
        EventKind::Delete => "delete",
    }
}

pub trait MetricsSink: Send + Sync {
    fn decision(&self, _cluster: &str, _outcome: DecisionOutcome) {}

    fn task_scheduled(&self, _cluster: &str, _kind: EventKind) {}

    fn unreachable_nodes(&self, _cluster: &str, _count: usize) {}

    fn dirty_write(&self, _config: &str) {}
}

/// Sink that drops every observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

#[cfg(any(test, feature = "test-util"))]
pub use recording::RecordingMetrics;

#[cfg(any(test, feature = "test-util"))]
mod recording {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Sink that keeps every observation in memory, for assertions.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingMetrics {
        decisions: Arc<Mutex<Vec<(String, DecisionOutcome)>>>,
        scheduled: Arc<Mutex<Vec<(String, EventKind)>>>,
        dirty_writes: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingMetrics {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn decisions(&self) -> Vec<(String, DecisionOutcome)> {
            self.decisions.lock().map(|d| d.clone()).unwrap_or_default()
        }

        pub fn scheduled(&self) -> Vec<(String, EventKind)> {
            self.scheduled.lock().map(|s| s.clone()).unwrap_or_default()
        }

        pub fn dirty_writes(&self) -> Vec<String> {
            self.dirty_writes.lock().map(|d| d.clone()).unwrap_or_default()
        }
    }

    impl MetricsSink for RecordingMetrics {
        fn decision(&self, cluster: &str, outcome: DecisionOutcome) {
            if let Ok(mut d) = self.decisions.lock() {
                d.push((cluster.to_string(), outcome));
            }
        }

        fn task_scheduled(&self, cluster: &str, kind: EventKind) {
            if let Ok(mut s) = self.scheduled.lock() {
                s.push((cluster.to_string(), kind));
            }
        }

        fn dirty_write(&self, config: &str) {
            if let Ok(mut d) = self.dirty_writes.lock() {
                d.push(config.to_string());
            }
        }
    }
}
