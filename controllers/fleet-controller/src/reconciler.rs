//! Per-config reconciliation.
//!
//! One pass reads a config, runs the decision loop over each of its
//! clusters and writes the result back under the version it was read at.
//! A dirty write means another writer got there first: the pass re-reads
//! and recomputes everything instead of merging.

use crate::error::ControllerError;
use chrono::{DateTime, Utc};
use fleet_model::{Clusters, Config, TaskEvent};
use fleet_store::ConfigStoreTrait;
use reconcile_engine::{Decision, MetricsSink, Reconciler, apply, dispatch};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of one reconciliation pass over a config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOutcome {
    /// The config was written back
    pub written: bool,
    /// Clusters dropped from the config
    pub removed: Vec<String>,
    /// Tasks queued on this pass
    pub scheduled: usize,
    /// Clusters whose decision failed with a non-blocking error
    pub failed: Vec<String>,
    /// Read/compute/write rounds it took
    pub attempts: u32,
}

#[derive(Debug, Default)]
struct Pass {
    changed: bool,
    removed: Vec<String>,
    scheduled: usize,
    failed: Vec<String>,
}

/// Drives the engine against the config store.
#[derive(Clone)]
pub struct ConfigReconciler {
    store: Arc<dyn ConfigStoreTrait>,
    engine: Reconciler,
    metrics: Arc<dyn MetricsSink>,
    lease: chrono::Duration,
    max_dirty_retries: u32,
}

impl ConfigReconciler {
    pub fn new(
        store: Arc<dyn ConfigStoreTrait>,
        engine: Reconciler,
        metrics: Arc<dyn MetricsSink>,
        lease: chrono::Duration,
        max_dirty_retries: u32,
    ) -> Self {
        Self { store, engine, metrics, lease, max_dirty_retries: max_dirty_retries.max(1) }
    }

    pub fn store(&self) -> &Arc<dyn ConfigStoreTrait> {
        &self.store
    }

    /// Reconciles every cluster of config `name` and persists the result.
    pub async fn reconcile_config(&self, name: &str) -> Result<ConfigOutcome, ControllerError> {
        for attempt in 1..=self.max_dirty_retries {
            let mut config = self.store.get(name).await?;
            let pass = self.plan(&mut config, Utc::now()).await;

            let mut outcome = ConfigOutcome {
                written: false,
                removed: pass.removed,
                scheduled: pass.scheduled,
                failed: pass.failed,
                attempts: attempt,
            };
            if !pass.changed {
                debug!("Config {} unchanged", name);
                return Ok(outcome);
            }

            match self.store.update(&config).await {
                Ok(written) => {
                    info!(
                        "Config {} written at version {} ({} tasks scheduled, {} clusters removed)",
                        name,
                        written.version,
                        outcome.scheduled,
                        outcome.removed.len()
                    );
                    outcome.written = true;
                    return Ok(outcome);
                }
                Err(e) if e.is_dirty_write() => {
                    warn!("Dirty write on config {} (attempt {}): {}", name, attempt, e);
                    self.metrics.dirty_write(name);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ControllerError::DirtyWriteRetriesExhausted { config: name.to_string(), attempts: self.max_dirty_retries })
    }

    async fn plan(&self, config: &mut Config, now: DateTime<Utc>) -> Pass {
        let mut pass = Pass::default();
        let names: Vec<String> = config.clusters.keys().cloned().collect();
        for cluster in names {
            let Some(state) = config.clusters.get_mut(&cluster) else {
                continue;
            };
            if dispatch::expire_lease(state, now) {
                warn!("Lease of cluster {} expired, task requeued", cluster);
                pass.changed = true;
            }

            match self.engine.decide(&cluster, state).await {
                Ok(Decision::Remove) => {
                    info!("Removing cluster {} from config {}", cluster, config.name);
                    config.clusters.remove(&cluster);
                    pass.removed.push(cluster);
                    pass.changed = true;
                }
                Ok(decision) => {
                    pass.scheduled += decision.tasks().len();
                    if apply(&decision, state) {
                        pass.changed = true;
                    }
                }
                Err(e) => {
                    error!("Decision for cluster {} failed: {}", cluster, e);
                    pass.failed.push(cluster);
                }
            }
        }
        pass
    }

    /// Applies a synchronous mutation under the same dirty-write retry
    /// rules as a reconciliation pass.
    async fn mutate<T>(
        &self,
        name: &str,
        mut f: impl FnMut(&mut Config) -> Result<(T, bool), ControllerError>,
    ) -> Result<T, ControllerError> {
        for attempt in 1..=self.max_dirty_retries {
            let mut config = self.store.get(name).await?;
            let (value, changed) = f(&mut config)?;
            if !changed {
                return Ok(value);
            }
            match self.store.update(&config).await {
                Ok(_) => return Ok(value),
                Err(e) if e.is_dirty_write() => {
                    warn!("Dirty write on config {} (attempt {}): {}", name, attempt, e);
                    self.metrics.dirty_write(name);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ControllerError::DirtyWriteRetriesExhausted { config: name.to_string(), attempts: self.max_dirty_retries })
    }

    /// Hands the next queued task of `cluster` to a worker, under a lease.
    pub async fn pull_task(&self, config: &str, cluster: &str) -> Result<Option<TaskEvent>, ControllerError> {
        let lease = self.lease;
        self.mutate(config, |doc| {
            let state = doc
                .clusters
                .get_mut(cluster)
                .ok_or_else(|| ControllerError::UnknownCluster(cluster.to_string()))?;
            let task = dispatch::pull_next(state, Utc::now(), lease);
            let changed = task.is_some();
            Ok((task, changed))
        })
        .await
    }

    /// Extends the lease of the in-flight task of `cluster`.
    pub async fn refresh_lease(&self, config: &str, cluster: &str, task_id: &str) -> Result<(), ControllerError> {
        let lease = self.lease;
        self.mutate(config, |doc| {
            let state = doc
                .clusters
                .get_mut(cluster)
                .ok_or_else(|| ControllerError::UnknownCluster(cluster.to_string()))?;
            dispatch::refresh_lease(state, task_id, Utc::now(), lease)?;
            Ok(((), true))
        })
        .await
    }

    /// Records a successful run: `reported` becomes the current state.
    pub async fn report_success(
        &self,
        config: &str,
        cluster: &str,
        task_id: &str,
        reported: Clusters,
    ) -> Result<(), ControllerError> {
        self.mutate(config, |doc| {
            let state = doc
                .clusters
                .get_mut(cluster)
                .ok_or_else(|| ControllerError::UnknownCluster(cluster.to_string()))?;
            dispatch::report_success(state, task_id, reported.clone())?;
            Ok(((), true))
        })
        .await?;
        info!("Task {} of cluster {} succeeded", task_id, cluster);
        Ok(())
    }

    pub async fn report_failure(
        &self,
        config: &str,
        cluster: &str,
        task_id: &str,
        description: &str,
    ) -> Result<(), ControllerError> {
        self.mutate(config, |doc| {
            let state = doc
                .clusters
                .get_mut(cluster)
                .ok_or_else(|| ControllerError::UnknownCluster(cluster.to_string()))?;
            dispatch::report_failure(state, task_id, description)?;
            Ok(((), true))
        })
        .await?;
        warn!("Task {} of cluster {} failed: {}", task_id, cluster, description);
        Ok(())
    }
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod reconciler_test;
