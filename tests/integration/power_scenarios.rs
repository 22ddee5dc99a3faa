//! Power controller scenarios driven through `PowerHandle`
//!
//! Telemetry and host actions are faked; the scheduled timer never fires
//! during the real-time tests because the shortest interval is 5 seconds.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use homewatch::actors::messages::{AlertSeverity, MonitorEvent, PowerEventType};
use homewatch::actors::power::{PowerHandle, TELEMETRY_FAILURE_ALERT_THRESHOLD};
use homewatch::ups::UpsTelemetry;
use pretty_assertions::assert_eq;

use crate::helpers::*;

fn spawn(
    enable_shutdown: bool,
    initial: UpsTelemetry,
) -> (
    PowerHandle,
    Arc<ScriptedTelemetry>,
    Arc<CountingActions>,
    Arc<RecordingSink>,
) {
    let telemetry = ScriptedTelemetry::new(initial);
    let actions = Arc::new(CountingActions::default());
    let (reporter, sink) = recording_reporter();
    let handle = PowerHandle::spawn(
        power_config(enable_shutdown),
        telemetry.clone(),
        actions.clone(),
        reporter,
    );
    (handle, telemetry, actions, sink)
}

#[tokio::test]
async fn test_emergency_runs_once_per_outage() {
    let (handle, telemetry, actions, sink) = spawn(true, reading(true, 50.0, 200));

    let state = handle.poll_now().await.unwrap();
    assert!(state.on_battery);
    assert!(state.emergency_triggered);
    assert!(state.graceful_triggered);
    assert_eq!(actions.stop_all_count(), 1);
    assert_eq!(actions.snapshot_count(), 1);
    assert_eq!(actions.flush_count(), 1);
    assert!(actions.stopped().is_empty());

    // Still below the critical threshold: nothing new happens
    telemetry.set(reading(true, 40.0, 150));
    handle.poll_now().await.unwrap();
    assert_eq!(actions.stop_all_count(), 1);
    assert_eq!(
        sink.event_types(),
        vec![
            PowerEventType::PowerLoss,
            PowerEventType::EmergencyShutdownInitiated
        ]
    );

    // Mains returns: guards re-arm
    telemetry.set(reading(false, 45.0, 900));
    let state = handle.poll_now().await.unwrap();
    assert!(!state.on_battery);
    assert!(!state.emergency_triggered);
    assert!(!state.graceful_triggered);
    assert!(!state.low_battery_alerted);

    // A second outage may trigger the emergency again
    telemetry.set(reading(true, 45.0, 200));
    handle.poll_now().await.unwrap();
    assert_eq!(actions.stop_all_count(), 2);
    assert_eq!(
        sink.event_types(),
        vec![
            PowerEventType::PowerLoss,
            PowerEventType::EmergencyShutdownInitiated,
            PowerEventType::PowerRestored,
            PowerEventType::PowerLoss,
            PowerEventType::EmergencyShutdownInitiated,
        ]
    );
    assert_eq!(sink.samples.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn test_warning_tier_sheds_load_then_escalates() {
    let (handle, telemetry, actions, sink) = spawn(true, reading(true, 80.0, 450));

    let state = handle.poll_now().await.unwrap();
    assert!(state.graceful_triggered);
    assert!(!state.emergency_triggered);
    assert_eq!(actions.snapshot_count(), 1);
    assert_eq!(
        actions.stopped(),
        vec![vec!["plex".to_string(), "sonarr".to_string()]]
    );
    assert_eq!(actions.stop_all_count(), 0);

    telemetry.set(reading(true, 60.0, 400));
    handle.poll_now().await.unwrap();
    assert_eq!(actions.stopped().len(), 1);

    telemetry.set(reading(true, 40.0, 250));
    let state = handle.poll_now().await.unwrap();
    assert!(state.emergency_triggered);
    assert_eq!(actions.stop_all_count(), 1);
    assert_eq!(actions.snapshot_count(), 2);

    telemetry.set(reading(true, 20.0, 100));
    handle.poll_now().await.unwrap();
    assert_eq!(actions.stop_all_count(), 1);

    assert_eq!(
        sink.event_types(),
        vec![
            PowerEventType::PowerLoss,
            PowerEventType::GracefulShutdownInitiated,
            PowerEventType::EmergencyShutdownInitiated,
        ]
    );
}

#[tokio::test]
async fn test_low_battery_alerts_once_and_does_not_block_graceful() {
    let (handle, telemetry, actions, sink) = spawn(true, reading(true, 20.0, 1200));

    let state = handle.poll_now().await.unwrap();
    assert!(state.low_battery_alerted);
    assert_eq!(actions.total(), 0);

    telemetry.set(reading(true, 15.0, 1100));
    handle.poll_now().await.unwrap();
    assert_eq!(sink.alerts_titled("Low battery").len(), 1);

    telemetry.set(reading(true, 12.0, 500));
    let state = handle.poll_now().await.unwrap();
    assert!(state.graceful_triggered);
    assert_eq!(actions.stopped().len(), 1);

    assert_eq!(
        sink.event_types(),
        vec![
            PowerEventType::PowerLoss,
            PowerEventType::LowBatteryWarning,
            PowerEventType::GracefulShutdownInitiated,
        ]
    );
}

#[tokio::test]
async fn test_dry_run_records_events_without_acting() {
    let (handle, telemetry, actions, sink) = spawn(false, reading(true, 50.0, 450));

    handle.poll_now().await.unwrap();
    telemetry.set(reading(true, 30.0, 200));
    let state = handle.poll_now().await.unwrap();

    assert!(state.graceful_triggered);
    assert!(state.emergency_triggered);
    assert_eq!(actions.total(), 0);

    let events = sink.events.lock().unwrap().clone();
    let emergency = events
        .iter()
        .find(|event| event.event_type == PowerEventType::EmergencyShutdownInitiated)
        .unwrap();
    assert_eq!(emergency.details["dry_run"], true);
    assert_eq!(emergency.runtime_remaining, 200);
    assert_eq!(sink.alerts_with_severity(AlertSeverity::Critical).len(), 1);
}

#[tokio::test]
async fn test_failing_action_does_not_abort_sequence() {
    let (handle, _telemetry, actions, _sink) = spawn(true, reading(true, 10.0, 100));
    actions.fail_snapshots.store(true, Ordering::SeqCst);

    let state = handle.poll_now().await.unwrap();

    assert!(state.emergency_triggered);
    assert_eq!(actions.stop_all_count(), 1);
    assert_eq!(actions.snapshot_count(), 1);
    assert_eq!(actions.flush_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hanging_action_is_cut_off_by_action_timeout() {
    let (handle, _telemetry, actions, sink) = spawn(true, reading(true, 50.0, 200));
    actions.hang_stop_all.store(true, Ordering::SeqCst);

    let started = tokio::time::Instant::now();
    tokio::time::timeout(Duration::from_secs(600), handle.poll_now())
        .await
        .expect("poll finished within the action timeout")
        .unwrap();

    // One action timeout for the stuck step, nothing for the rest
    assert_eq!(started.elapsed(), power_config(true).action_timeout());
    assert_eq!(actions.stop_all_count(), 1);
    assert_eq!(actions.snapshot_count(), 1);
    assert_eq!(actions.flush_count(), 1);
    assert_eq!(
        sink.event_types(),
        vec![
            PowerEventType::PowerLoss,
            PowerEventType::EmergencyShutdownInitiated
        ]
    );

    // The controller keeps serving commands afterwards
    assert!(handle.state().await.unwrap().emergency_triggered);
}

#[tokio::test]
async fn test_telemetry_outage_alerts_once() {
    let (handle, telemetry, actions, sink) = spawn(true, reading(false, 100.0, 2000));
    telemetry.fail("upsc: connection refused");

    for _ in 0..5 {
        assert!(handle.poll_now().await.is_err());
    }

    let state = handle.state().await.unwrap();
    assert_eq!(state.consecutive_telemetry_failures, 5);
    assert_eq!(state.last_sample_at, None);

    let alerts = sink.alerts_titled("UPS telemetry unavailable");
    assert_eq!(alerts.len(), 1);
    assert!(
        alerts[0]
            .message
            .contains(&TELEMETRY_FAILURE_ALERT_THRESHOLD.to_string())
    );
    assert!(sink.samples.lock().unwrap().is_empty());

    telemetry.set(reading(false, 100.0, 2000));
    let state = handle.poll_now().await.unwrap();
    assert_eq!(state.consecutive_telemetry_failures, 0);
    assert!(state.last_sample_at.is_some());
    assert_eq!(actions.total(), 0);
}

#[tokio::test]
async fn test_samples_and_events_reach_the_bus() {
    let telemetry = ScriptedTelemetry::new(reading(true, 90.0, 1500));
    let (reporter, _sink) = recording_reporter();
    let mut events = reporter.subscribe();
    let handle = PowerHandle::spawn(
        power_config(false),
        telemetry,
        Arc::new(CountingActions::default()),
        reporter,
    );

    handle.poll_now().await.unwrap();

    let mut topics = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let MonitorEvent::PowerSample(sample) = &event {
            assert_eq!(sample.ups_name, "ups@test");
            assert!(sample.on_battery);
        }
        topics.push(event.topic());
    }
    assert_eq!(topics, vec!["power_sample", "alert", "power_event"]);
}

#[tokio::test(start_paused = true)]
async fn test_poll_interval_follows_supply() {
    let (handle, telemetry, _actions, _sink) = spawn(false, reading(true, 95.0, 3000));

    // First scheduled poll one interval after spawn
    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(telemetry.fetch_count(), 0);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(telemetry.fetch_count(), 1);

    // On battery: every 5 seconds (35s, 40s)
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(telemetry.fetch_count(), 3);

    // Mains at the 45s poll, back to 30 seconds
    telemetry.set(reading(false, 95.0, 3000));
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(telemetry.fetch_count(), 4);
    assert!(!handle.state().await.unwrap().on_battery);

    tokio::time::sleep(Duration::from_secs(24)).await;
    assert_eq!(telemetry.fetch_count(), 4);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(telemetry.fetch_count(), 5);

    handle.stop();
}

#[tokio::test]
async fn test_stop_ends_controller() {
    let (handle, _telemetry, _actions, _sink) = spawn(true, reading(false, 100.0, 2000));

    handle.stop();

    assert!(handle.poll_now().await.is_err());
    assert!(handle.state().await.is_err());
}
