//! Prometheus-backed metrics sink.

use crate::error::ControllerError;
use fleet_model::EventKind;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use reconcile_engine::metrics::event_kind_label;
use reconcile_engine::{DecisionOutcome, MetricsSink};

#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    decisions: IntCounterVec,
    tasks_scheduled: IntCounterVec,
    unreachable_nodes: IntGaugeVec,
    dirty_writes: IntCounterVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();
        let decisions = IntCounterVec::new(
            Opts::new("fleet_decisions_total", "Decisions taken per cluster and branch"),
            &["cluster", "outcome"],
        )?;
        let tasks_scheduled = IntCounterVec::new(
            Opts::new("fleet_tasks_scheduled_total", "Tasks queued per cluster and kind"),
            &["cluster", "kind"],
        )?;
        let unreachable_nodes = IntGaugeVec::new(
            Opts::new("fleet_unreachable_nodes", "Nodes that did not answer the last probe"),
            &["cluster"],
        )?;
        let dirty_writes = IntCounterVec::new(
            Opts::new("fleet_dirty_writes_total", "Config writes rejected for a stale version"),
            &["config"],
        )?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(tasks_scheduled.clone()))?;
        registry.register(Box::new(unreachable_nodes.clone()))?;
        registry.register(Box::new(dirty_writes.clone()))?;

        Ok(Self { registry, decisions, tasks_scheduled, unreachable_nodes, dirty_writes })
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> Result<String, ControllerError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ControllerError::Metrics(prometheus::Error::Msg(e.to_string())))
    }
}

impl MetricsSink for PrometheusMetrics {
    fn decision(&self, cluster: &str, outcome: DecisionOutcome) {
        self.decisions.with_label_values(&[cluster, outcome.as_str()]).inc();
    }

    fn task_scheduled(&self, cluster: &str, kind: EventKind) {
        self.tasks_scheduled.with_label_values(&[cluster, event_kind_label(kind)]).inc();
    }

    fn unreachable_nodes(&self, cluster: &str, count: usize) {
        self.unreachable_nodes
            .with_label_values(&[cluster])
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    fn dirty_write(&self, config: &str) {
        self.dirty_writes.with_label_values(&[config]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_exposes_observations() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.decision("prod", DecisionOutcome::Create);
        metrics.decision("prod", DecisionOutcome::Create);
        metrics.task_scheduled("prod", EventKind::Create);
        metrics.unreachable_nodes("prod", 2);
        metrics.dirty_write("fleet");

        let text = metrics.render().unwrap();
        assert!(text.contains("fleet_decisions_total{cluster=\"prod\",outcome=\"create\"} 2"));
        assert!(text.contains("fleet_tasks_scheduled_total{cluster=\"prod\",kind=\"create\"} 1"));
        assert!(text.contains("fleet_unreachable_nodes{cluster=\"prod\"} 2"));
        assert!(text.contains("fleet_dirty_writes_total{config=\"fleet\"} 1"));
    }

    #[test]
    fn test_gauge_follows_latest_probe() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.unreachable_nodes("prod", 3);
        metrics.unreachable_nodes("prod", 0);
        assert!(metrics.render().unwrap().contains("fleet_unreachable_nodes{cluster=\"prod\"} 0"));
    }
}
