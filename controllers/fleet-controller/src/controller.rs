//! Main controller implementation.
//!
//! The `Controller` ticks on a fixed interval. Each tick lists every stored
//! config and reconciles them concurrently, up to the configured limit.
//! A config whose pass fails is skipped for a Fibonacci-growing number of
//! ticks before it is tried again.

use crate::error::ControllerError;
use crate::reconciler::{ConfigOutcome, ConfigReconciler};
use futures::StreamExt;
use reconcile_engine::FibonacciBackoff;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct Throttle {
    backoff: FibonacciBackoff,
    /// Ticks left to skip
    skip: u64,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub reconciled: usize,
    /// Configs skipped because they are backing off
    pub skipped: usize,
    pub failed: usize,
}

pub struct Controller {
    reconciler: ConfigReconciler,
    tick: Duration,
    concurrency: usize,
    throttles: Mutex<BTreeMap<String, Throttle>>,
}

impl Controller {
    pub fn new(reconciler: ConfigReconciler, tick: Duration, concurrency: usize) -> Self {
        Self { reconciler, tick, concurrency: concurrency.max(1), throttles: Mutex::new(BTreeMap::new()) }
    }

    /// Runs ticks forever. A failed tick is logged and the loop goes on.
    pub async fn run(&self) -> Result<(), ControllerError> {
        info!("Starting reconciliation loop (tick every {:?}, {} configs at a time)", self.tick, self.concurrency);
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match self.tick().await {
                Ok(summary) => debug!(?summary, "Tick finished"),
                Err(e) => error!("Tick failed: {}", e),
            }
        }
    }

    /// One reconciliation round over every stored config.
    pub async fn tick(&self) -> Result<TickSummary, ControllerError> {
        let names = self.reconciler.store().list().await?;
        let due = self.due(names).await;
        let mut summary = TickSummary { skipped: due.skipped, ..Default::default() };

        let results: Vec<(String, Result<ConfigOutcome, ControllerError>)> = futures::stream::iter(due.names)
            .map(|name| async move {
                let result = self.reconciler.reconcile_config(&name).await;
                (name, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (name, result) in results {
            if self.record(&name, result).await {
                summary.reconciled += 1;
            } else {
                summary.failed += 1;
            }
        }
        Ok(summary)
    }

    async fn due(&self, names: Vec<String>) -> Due {
        let mut throttles = self.throttles.lock().await;
        throttles.retain(|name, _| names.contains(name));

        let mut due = Due::default();
        for name in names {
            match throttles.get_mut(&name) {
                Some(throttle) if throttle.skip > 0 => {
                    throttle.skip -= 1;
                    debug!("Config {} backing off ({} ticks left)", name, throttle.skip);
                    due.skipped += 1;
                }
                _ => due.names.push(name),
            }
        }
        due
    }

    /// Returns true when the pass succeeded for every cluster.
    async fn record(&self, name: &str, result: Result<ConfigOutcome, ControllerError>) -> bool {
        let failure = match result {
            Ok(outcome) if outcome.failed.is_empty() => None,
            Ok(outcome) => Some(format!("clusters {} failed", outcome.failed.join(", "))),
            Err(e) => Some(e.to_string()),
        };

        let mut throttles = self.throttles.lock().await;
        match failure {
            None => {
                throttles.remove(name);
                true
            }
            Some(reason) => {
                let throttle = throttles.entry(name.to_string()).or_default();
                throttle.skip = throttle.backoff.next_ticks();
                warn!("Reconciling config {} failed: {} (skipping {} ticks)", name, reason, throttle.skip);
                false
            }
        }
    }
}

#[derive(Debug, Default)]
struct Due {
    names: Vec<String>,
    skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_model::{ClusterState, Config};
    use fleet_store::{ConfigStoreTrait, MockConfigStore};
    use reconcile_engine::test_utils::*;
    use reconcile_engine::{HealthOracle, Reconciler};
    use std::sync::Arc;

    fn controller(store: &MockConfigStore, oracle: impl HealthOracle + 'static) -> Controller {
        let engine = Reconciler::new(Arc::new(oracle), Arc::new(SequentialIdentity::new()), Arc::new(RecordingMetrics::new()));
        let reconciler = ConfigReconciler::new(
            Arc::new(store.clone()),
            engine,
            Arc::new(RecordingMetrics::new()),
            chrono::Duration::seconds(60),
            3,
        );
        Controller::new(reconciler, Duration::from_secs(1), 2)
    }

    fn running_config(name: &str) -> Config {
        let snapshot = clusters(k8s("prod", vec![dynamic_pool("control", true, &["c1"])]), vec![]);
        let mut config = Config::new(name);
        config.clusters.insert("prod".to_string(), settled(snapshot.clone(), snapshot));
        config
    }

    #[tokio::test]
    async fn test_tick_reconciles_every_config() {
        let store = MockConfigStore::new();
        let desired = clusters(k8s("prod", vec![dynamic_pool("control", true, &["c1"])]), vec![]);
        let mut fresh = Config::new("fleet-a");
        fresh.clusters.insert("prod".to_string(), ClusterState::new(desired));
        store.add_config(fresh).await;
        store.add_config(running_config("fleet-b")).await;

        let summary = controller(&store, StaticOracle::new()).tick().await.unwrap();
        assert_eq!(summary, TickSummary { reconciled: 2, skipped: 0, failed: 0 });
        assert_eq!(store.get("fleet-a").await.unwrap().clusters["prod"].events.len(), 1);
        assert!(store.get("fleet-b").await.unwrap().clusters["prod"].events.is_empty());
    }

    #[tokio::test]
    async fn test_failing_config_backs_off() {
        let store = MockConfigStore::new();
        store.add_config(running_config("fleet")).await;
        let controller = controller(&store, StaticOracle::new().failing_ping());

        // First failure skips one tick, the second one skips one more.
        let first = controller.tick().await.unwrap();
        assert_eq!(first.failed, 1);
        let second = controller.tick().await.unwrap();
        assert_eq!(second, TickSummary { reconciled: 0, skipped: 1, failed: 0 });
        let third = controller.tick().await.unwrap();
        assert_eq!(third.failed, 1);
        assert_eq!(controller.tick().await.unwrap().skipped, 1);
    }

    #[tokio::test]
    async fn test_store_outage_fails_the_tick() {
        let store = MockConfigStore::new();
        store.add_config(running_config("fleet")).await;
        store.set_unavailable(true);
        assert!(matches!(
            controller(&store, StaticOracle::new()).tick().await,
            Err(ControllerError::Store(_))
        ));
    }
}
