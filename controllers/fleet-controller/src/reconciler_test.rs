use super::*;
use fleet_model::{ClusterState, Delta, WorkflowStatus};
use fleet_store::MockConfigStore;
use reconcile_engine::test_utils::*;

fn reconciler(store: &MockConfigStore, metrics: &RecordingMetrics, max_dirty_retries: u32) -> ConfigReconciler {
    let engine = Reconciler::new(
        Arc::new(StaticOracle::new()),
        Arc::new(SequentialIdentity::new()),
        Arc::new(metrics.clone()),
    );
    ConfigReconciler::new(
        Arc::new(store.clone()),
        engine,
        Arc::new(metrics.clone()),
        chrono::Duration::seconds(60),
        max_dirty_retries,
    )
}

fn desired() -> Clusters {
    clusters(k8s("prod", vec![dynamic_pool("control", true, &["c1"])]), vec![])
}

async fn seed(store: &MockConfigStore, state: ClusterState) {
    let mut config = Config::new("fleet");
    config.clusters.insert("prod".to_string(), state);
    store.add_config(config).await;
}

#[tokio::test]
async fn test_new_cluster_is_scheduled_and_written() {
    let store = MockConfigStore::new();
    let metrics = RecordingMetrics::new();
    seed(&store, ClusterState::new(desired())).await;

    let outcome = reconciler(&store, &metrics, 3).reconcile_config("fleet").await.unwrap();
    assert!(outcome.written);
    assert_eq!(outcome.scheduled, 1);
    assert_eq!(outcome.attempts, 1);

    let stored = store.get("fleet").await.unwrap();
    assert_eq!(stored.version, 2);
    let state = &stored.clusters["prod"];
    assert_eq!(state.events.len(), 1);
    assert_eq!(state.events[0].task.delta, Delta::Create);
    assert_eq!(state.state.status, WorkflowStatus::WaitForPickup);
}

#[tokio::test]
async fn test_unchanged_config_is_not_written() {
    let store = MockConfigStore::new();
    let metrics = RecordingMetrics::new();
    seed(&store, settled(desired(), desired())).await;

    let outcome = reconciler(&store, &metrics, 3).reconcile_config("fleet").await.unwrap();
    assert!(!outcome.written);
    assert_eq!(store.update_calls(), 0);
    assert_eq!(store.get("fleet").await.unwrap().version, 1);
}

#[tokio::test]
async fn test_dirty_write_is_recomputed() {
    let store = MockConfigStore::new();
    let metrics = RecordingMetrics::new();
    seed(&store, ClusterState::new(desired())).await;
    store.fail_next_updates(1);

    let outcome = reconciler(&store, &metrics, 3).reconcile_config("fleet").await.unwrap();
    assert!(outcome.written);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(store.update_calls(), 2);
    assert_eq!(metrics.dirty_writes(), vec!["fleet".to_string()]);

    // The losing pass was discarded, so the task is queued exactly once.
    assert_eq!(store.get("fleet").await.unwrap().clusters["prod"].events.len(), 1);
}

#[tokio::test]
async fn test_dirty_write_retries_are_bounded() {
    let store = MockConfigStore::new();
    let metrics = RecordingMetrics::new();
    seed(&store, ClusterState::new(desired())).await;
    store.fail_next_updates(10);

    let err = reconciler(&store, &metrics, 3).reconcile_config("fleet").await.unwrap_err();
    assert!(matches!(err, ControllerError::DirtyWriteRetriesExhausted { attempts: 3, .. }));
    assert_eq!(metrics.dirty_writes().len(), 3);
}

#[tokio::test]
async fn test_removable_cluster_is_dropped() {
    let store = MockConfigStore::new();
    let metrics = RecordingMetrics::new();
    seed(&store, ClusterState::default()).await;

    let outcome = reconciler(&store, &metrics, 3).reconcile_config("fleet").await.unwrap();
    assert_eq!(outcome.removed, vec!["prod".to_string()]);
    assert!(store.get("fleet").await.unwrap().clusters.is_empty());
}

#[tokio::test]
async fn test_missing_config_is_an_error() {
    let store = MockConfigStore::new();
    let metrics = RecordingMetrics::new();
    assert!(matches!(
        reconciler(&store, &metrics, 3).reconcile_config("nope").await,
        Err(ControllerError::Store(_))
    ));
}

#[tokio::test]
async fn test_pull_and_report_roundtrip() {
    let store = MockConfigStore::new();
    let metrics = RecordingMetrics::new();
    seed(&store, ClusterState::new(desired())).await;
    let reconciler = reconciler(&store, &metrics, 3);
    reconciler.reconcile_config("fleet").await.unwrap();

    let task = reconciler.pull_task("fleet", "prod").await.unwrap().unwrap();
    assert!(task.lease.is_some());
    // Only one task is handed out at a time.
    assert!(reconciler.pull_task("fleet", "prod").await.unwrap().is_none());
    reconciler.refresh_lease("fleet", "prod", &task.id).await.unwrap();

    reconciler.report_success("fleet", "prod", &task.id, desired()).await.unwrap();
    let state = store.get("fleet").await.unwrap().clusters["prod"].clone();
    assert!(state.in_flight.is_none());
    assert_eq!(state.current, desired());
    assert_eq!(state.state.status, WorkflowStatus::Done);

    // Converged now: the next pass leaves the config alone.
    assert!(!reconciler.reconcile_config("fleet").await.unwrap().written);
}

#[tokio::test]
async fn test_report_for_another_task_is_rejected() {
    let store = MockConfigStore::new();
    let metrics = RecordingMetrics::new();
    seed(&store, ClusterState::new(desired())).await;
    let reconciler = reconciler(&store, &metrics, 3);
    reconciler.reconcile_config("fleet").await.unwrap();
    reconciler.pull_task("fleet", "prod").await.unwrap().unwrap();

    assert!(matches!(
        reconciler.report_failure("fleet", "prod", "not-the-task", "boom").await,
        Err(ControllerError::Dispatch(_))
    ));
    assert!(matches!(
        reconciler.pull_task("fleet", "staging").await,
        Err(ControllerError::UnknownCluster(_))
    ));
}

#[tokio::test]
async fn test_failure_report_marks_cluster_error() {
    let store = MockConfigStore::new();
    let metrics = RecordingMetrics::new();
    seed(&store, ClusterState::new(desired())).await;
    let reconciler = reconciler(&store, &metrics, 3);
    reconciler.reconcile_config("fleet").await.unwrap();
    let task = reconciler.pull_task("fleet", "prod").await.unwrap().unwrap();

    reconciler.report_failure("fleet", "prod", &task.id, "provider quota").await.unwrap();
    let state = store.get("fleet").await.unwrap().clusters["prod"].clone();
    assert_eq!(state.state.status, WorkflowStatus::Error);
    assert_eq!(state.state.description, "provider quota");
    assert!(state.in_flight.is_some());
}

#[tokio::test]
async fn test_expired_lease_is_requeued() {
    let store = MockConfigStore::new();
    let metrics = RecordingMetrics::new();
    seed(&store, ClusterState::new(desired())).await;
    let reconciler = reconciler(&store, &metrics, 3);
    reconciler.reconcile_config("fleet").await.unwrap();
    let task = reconciler.pull_task("fleet", "prod").await.unwrap().unwrap();

    // Backdate the lease as if the worker vanished long ago.
    let mut config = store.get("fleet").await.unwrap();
    let state = config.clusters.get_mut("prod").unwrap();
    if let Some(lease) = state.in_flight.as_mut().and_then(|t| t.lease.as_mut()) {
        lease.expires_at = Utc::now() - chrono::Duration::seconds(1);
    }
    store.update(&config).await.unwrap();

    let outcome = reconciler.reconcile_config("fleet").await.unwrap();
    assert!(outcome.written);
    let state = store.get("fleet").await.unwrap().clusters["prod"].clone();
    assert!(state.in_flight.is_none());
    assert_eq!(state.events.len(), 1);
    assert_ne!(state.events[0].id, task.id);
    assert_eq!(state.events[0].task.delta, Delta::Create);
}
