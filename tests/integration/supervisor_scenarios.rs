//! Supervisor scenarios: probes, breakers and restarts end to end
//!
//! Records flow supervisor → EventReporter → StorageHandle → MemoryBackend.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use homewatch::actors::messages::{AlertSeverity, ServiceKind};
use homewatch::actors::storage::StorageHandle;
use homewatch::actors::supervisor::{DATABASE_SERVICE, Dependency, Registry, SupervisorHandle};
use homewatch::alerts::EventReporter;
use homewatch::breaker::CircuitPhase;
use homewatch::config::SupervisorConfig;
use homewatch::probes::DatabaseProbe;
use homewatch::storage::StorageBackend;
use homewatch::storage::memory::MemoryBackend;
use homewatch::workers::Worker;
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

use crate::helpers::*;

fn persisted_reporter() -> (EventReporter, StorageHandle, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::new());
    let storage = StorageHandle::spawn(backend.clone(), None);
    let (tx, _) = broadcast::channel(256);
    (
        EventReporter::new(Arc::new(storage.clone()), tx),
        storage,
        backend,
    )
}

fn supervisor_config(max_restart_attempts: u32) -> SupervisorConfig {
    SupervisorConfig {
        max_restart_attempts,
        restart_base_delay: 1,
        probe_timeout: 1,
        ..SupervisorConfig::default()
    }
}

#[tokio::test]
async fn test_sweep_persists_one_record_per_service() {
    let (reporter, storage, backend) = persisted_reporter();
    let database: Arc<dyn StorageBackend> = backend.clone();
    let registry = Registry::default()
        .with_database(Arc::new(DatabaseProbe::new(database)))
        .with_dependency(
            Dependency::new("redis", ToggleProbe::new(true), breaker_config(3, 3, 1, 1_000))
                .unwrap(),
        )
        .with_worker(Worker::from_component("plex", FakeWorker::new(true)));
    let handle = SupervisorHandle::spawn(supervisor_config(3), registry, reporter);

    let report = handle.sweep_now().await.unwrap();
    assert!(report.healthy);
    assert_eq!(report.services.len(), 3);

    // A second sweep updates in place
    handle.sweep_now().await.unwrap();
    storage.flush().await.unwrap();

    let stored = backend.query_service_health().await.unwrap();
    let names: Vec<&str> = stored.iter().map(|h| h.service_name.as_str()).collect();
    assert_eq!(names, vec![DATABASE_SERVICE, "plex", "redis"]);

    let kinds: Vec<ServiceKind> = stored.iter().map(|h| h.kind).collect();
    assert_eq!(
        kinds,
        vec![ServiceKind::Database, ServiceKind::Worker, ServiceKind::Dependency]
    );
    assert!(stored.iter().all(|h| h.healthy && h.last_success_at.is_some()));
    assert_eq!(stored[2].circuit_phase, Some(CircuitPhase::Closed));

    // Nothing went wrong, so nothing was alerted
    let since = Utc::now() - chrono::Duration::hours(1);
    assert!(backend.query_alerts(since).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_short_circuits_and_recovers() {
    let (reporter, storage, backend) = persisted_reporter();
    let probe = ToggleProbe::new(false);
    let registry = Registry::default().with_dependency(
        Dependency::new("nas", probe.clone(), breaker_config(2, 2, 1, 1_000)).unwrap(),
    );
    let handle = SupervisorHandle::spawn(supervisor_config(3), registry, reporter);

    let report = handle.sweep_now().await.unwrap();
    let nas = report.service("nas").unwrap();
    assert!(!nas.health.healthy);
    assert_eq!(nas.health.circuit_phase, Some(CircuitPhase::Closed));

    let report = handle.sweep_now().await.unwrap();
    let nas = report.service("nas").unwrap();
    assert_eq!(nas.health.circuit_phase, Some(CircuitPhase::Open));
    assert_eq!(nas.health.consecutive_failures, 2);

    // Short-circuited: the probe does not run and the streak holds
    let report = handle.sweep_now().await.unwrap();
    let nas = report.service("nas").unwrap();
    assert_eq!(probe.call_count(), 2);
    assert_eq!(nas.health.consecutive_failures, 2);
    assert_eq!(nas.breaker.as_ref().unwrap().total_rejections, 1);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    probe.set_healthy(true);

    let report = handle.sweep_now().await.unwrap();
    let nas = report.service("nas").unwrap();
    assert!(nas.health.healthy);
    assert_eq!(nas.health.circuit_phase, Some(CircuitPhase::Closed));
    assert_eq!(nas.health.consecutive_failures, 0);
    assert!(report.healthy);

    storage.flush().await.unwrap();
    let since = Utc::now() - chrono::Duration::hours(1);
    let titles: Vec<String> = backend
        .query_alerts(since)
        .await
        .unwrap()
        .into_iter()
        .map(|alert| alert.title)
        .collect();
    assert_eq!(
        titles,
        vec![
            "dependency nas is unhealthy",
            "Circuit opened: nas",
            "dependency nas recovered"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_budget_alerts_once_until_reset() {
    let (reporter, sink) = recording_reporter();
    let worker = FakeWorker::new(false);
    let registry = Registry::default().with_worker(Worker::from_component("sonarr", worker.clone()));
    let handle = SupervisorHandle::spawn(supervisor_config(2), registry, reporter);

    for _ in 0..2 {
        handle.sweep_now().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    assert_eq!(worker.stop_count(), 2);
    assert_eq!(worker.start_count(), 2);

    for _ in 0..3 {
        let report = handle.sweep_now().await.unwrap();
        let sonarr = report.service("sonarr").unwrap();
        assert_eq!(sonarr.health.restart_attempts, 2);
        assert!(sonarr.health.restarts_exhausted);
    }
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(worker.start_count(), 2);
    assert_eq!(sink.alerts_with_severity(AlertSeverity::Critical).len(), 1);

    handle.reset_restart_attempts("sonarr").await.unwrap();
    let report = handle.sweep_now().await.unwrap();
    let sonarr = report.service("sonarr").unwrap();
    assert_eq!(sonarr.health.restart_attempts, 1);
    assert!(!sonarr.health.restarts_exhausted);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(worker.start_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_recovery_resets_restart_counter() {
    let (reporter, _sink) = recording_reporter();
    let worker = FakeWorker::new(false);
    let registry = Registry::default().with_worker(Worker::from_component("radarr", worker.clone()));
    let handle = SupervisorHandle::spawn(supervisor_config(3), registry, reporter);

    handle.sweep_now().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    let report = handle.sweep_now().await.unwrap();
    assert_eq!(report.service("radarr").unwrap().health.restart_attempts, 2);

    worker.set_running(true);
    let report = handle.sweep_now().await.unwrap();
    let radarr = report.service("radarr").unwrap();
    assert!(radarr.health.healthy);
    assert_eq!(radarr.health.restart_attempts, 0);

    // The pending second restart was cancelled
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(worker.start_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_probe_times_out_as_failure() {
    let (reporter, _sink) = recording_reporter();
    let registry = Registry::default().with_dependency(
        Dependency::new("jellyfin", Arc::new(HangingProbe), breaker_config(5, 10, 2, 60_000))
            .unwrap(),
    );
    let handle = SupervisorHandle::spawn(supervisor_config(3), registry, reporter);

    let report = handle.sweep_now().await.unwrap();
    let jellyfin = report.service("jellyfin").unwrap();

    assert!(!jellyfin.health.healthy);
    assert_eq!(jellyfin.health.consecutive_failures, 1);
    assert!(
        jellyfin
            .health
            .error_message
            .as_deref()
            .unwrap()
            .contains("timed out")
    );
    assert_eq!(jellyfin.breaker.as_ref().unwrap().total_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_abandons_sweep_in_flight() {
    let (reporter, _sink) = recording_reporter();
    let config = SupervisorConfig {
        probe_timeout: 600,
        ..SupervisorConfig::default()
    };
    let registry = Registry::default()
        .with_dependency(
            Dependency::new("slow", Arc::new(HangingProbe), breaker_config(5, 10, 2, 60_000))
                .unwrap(),
        )
        .with_worker(Worker::from_component("plex", FakeWorker::new(true)));
    let handle = SupervisorHandle::spawn(config, registry, reporter);

    let sweeping = tokio::spawn({
        let handle = handle.clone();
        async move { handle.sweep_now().await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    handle.stop();

    // Outcomes applied before the stop are kept, the rest are dropped
    let report = sweeping.await.unwrap().unwrap();
    assert!(report.service("plex").is_some());
    assert!(report.service("slow").is_none());

    assert!(handle.sweep_now().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_sweeps_run_on_interval() {
    let (reporter, sink) = recording_reporter();
    let probe = ToggleProbe::new(true);
    let registry = Registry::default().with_dependency(
        Dependency::new("grafana", probe.clone(), breaker_config(5, 10, 2, 60_000)).unwrap(),
    );
    let config = SupervisorConfig {
        interval: 1,
        ..SupervisorConfig::default()
    };
    let handle = SupervisorHandle::spawn(config, registry, reporter);

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    handle.stop();

    assert_eq!(probe.call_count(), 2);
    assert_eq!(sink.health.lock().unwrap().len(), 2);
}
