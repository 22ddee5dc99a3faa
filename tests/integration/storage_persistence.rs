//! Integration tests for storage persistence
//!
//! These tests verify that:
//! - Power samples, events and alerts reach SQLite through the storage actor
//! - Service health rows are upserted, not appended
//! - Records survive reopening the database file

use std::sync::Arc;

use chrono::Utc;
use homewatch::actors::messages::{AlertSeverity, PowerEventType};
use homewatch::actors::power::PowerHandle;
use homewatch::actors::storage::StorageHandle;
use homewatch::actors::supervisor::{Dependency, Registry, SupervisorHandle};
use homewatch::alerts::EventReporter;
use homewatch::config::SupervisorConfig;
use homewatch::storage::StorageBackend;
use homewatch::storage::sqlite::SqliteBackend;
use tempfile::tempdir;
use tokio::sync::broadcast;

use crate::helpers::*;

fn reporter_for(storage: &StorageHandle) -> EventReporter {
    let (tx, _) = broadcast::channel(256);
    EventReporter::new(Arc::new(storage.clone()), tx)
}

#[tokio::test]
async fn test_power_audit_log_is_persisted() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("homewatch.db");

    let backend = Arc::new(SqliteBackend::new(&db_path).await.unwrap());
    let storage = StorageHandle::spawn(backend.clone(), Some(30));

    let telemetry = ScriptedTelemetry::new(reading(true, 60.0, 200));
    let power = PowerHandle::spawn(
        power_config(false),
        telemetry.clone(),
        Arc::new(CountingActions::default()),
        reporter_for(&storage),
    );

    power.poll_now().await.unwrap();
    telemetry.set(reading(false, 55.0, 1800));
    power.poll_now().await.unwrap();
    power.stop();

    storage.flush().await.unwrap();

    let since = Utc::now() - chrono::Duration::hours(1);
    let events = backend.query_power_events(since).await.unwrap();
    let types: Vec<PowerEventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            PowerEventType::PowerLoss,
            PowerEventType::EmergencyShutdownInitiated,
            PowerEventType::PowerRestored,
        ]
    );
    assert_eq!(events[1].details["dry_run"], true);
    assert_eq!(events[1].runtime_remaining, 200);

    let samples = backend.query_latest_power_samples(10).await.unwrap();
    assert_eq!(samples.len(), 2);
    assert!(samples[0].on_battery);
    assert!(!samples[1].on_battery);
    assert_eq!(samples[0].status_flags, vec!["OB", "DISCHRG"]);

    let alerts = backend.query_alerts(since).await.unwrap();
    assert!(
        alerts
            .iter()
            .any(|alert| alert.severity == AlertSeverity::Critical && alert.source == "power")
    );

    storage.shutdown().await;

    // The file outlives the backend
    let reopened = SqliteBackend::new(&db_path).await.unwrap();
    assert_eq!(reopened.query_power_events(since).await.unwrap().len(), 3);
    reopened.close().await.unwrap();
}

#[tokio::test]
async fn test_service_health_rows_are_upserted() {
    let temp_dir = tempdir().unwrap();
    let backend = Arc::new(
        SqliteBackend::new(temp_dir.path().join("health.db"))
            .await
            .unwrap(),
    );
    let storage = StorageHandle::spawn(backend.clone(), None);

    let probe = ToggleProbe::new(false);
    let registry = Registry::default().with_dependency(
        Dependency::new("zfs", probe.clone(), breaker_config(5, 10, 2, 60_000)).unwrap(),
    );
    let supervisor =
        SupervisorHandle::spawn(SupervisorConfig::default(), registry, reporter_for(&storage));

    for _ in 0..3 {
        supervisor.sweep_now().await.unwrap();
    }
    supervisor.stop();
    storage.flush().await.unwrap();

    let rows = backend.query_service_health().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].service_name, "zfs");
    assert!(!rows[0].healthy);
    assert_eq!(rows[0].consecutive_failures, 3);
    assert_eq!(rows[0].error_message.as_deref(), Some("connection refused"));

    let stats = storage.stats().await.unwrap();
    assert_eq!(stats.write_failures, 0);
    // Three health rows plus the "unhealthy" alert
    assert_eq!(stats.records_written, 4);
}
