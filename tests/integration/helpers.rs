//! Fakes shared by the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use homewatch::actions::{ActionReport, ShutdownActions};
use homewatch::actors::messages::{
    Alert, AlertSeverity, PowerEventRecord, PowerEventType, PowerSample, ServiceHealth,
};
use homewatch::alerts::EventReporter;
use homewatch::config::{BreakerConfig, PowerConfig};
use homewatch::probes::DependencyProbe;
use homewatch::sink::PersistenceSink;
use homewatch::ups::{UpsTelemetry, UpsTelemetrySource};
use homewatch::workers::{LivenessCheckable, Startable, Stoppable};
use tokio::sync::broadcast;

/// Sink that keeps every record in memory
#[derive(Default)]
pub struct RecordingSink {
    pub health: Mutex<Vec<ServiceHealth>>,
    pub samples: Mutex<Vec<PowerSample>>,
    pub events: Mutex<Vec<PowerEventRecord>>,
    pub alerts: Mutex<Vec<Alert>>,
}

impl RecordingSink {
    pub fn event_types(&self) -> Vec<PowerEventType> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.event_type)
            .collect()
    }

    pub fn alerts_titled(&self, title: &str) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap()
            .iter()
            .filter(|alert| alert.title == title)
            .cloned()
            .collect()
    }

    pub fn alerts_with_severity(&self, severity: AlertSeverity) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap()
            .iter()
            .filter(|alert| alert.severity == severity)
            .cloned()
            .collect()
    }
}

impl PersistenceSink for RecordingSink {
    fn record_service_health(&self, snapshot: ServiceHealth) {
        self.health.lock().unwrap().push(snapshot);
    }

    fn record_power_sample(&self, sample: PowerSample) {
        self.samples.lock().unwrap().push(sample);
    }

    fn record_power_event(&self, event: PowerEventRecord) {
        self.events.lock().unwrap().push(event);
    }

    fn record_alert(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

pub fn recording_reporter() -> (EventReporter, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let (tx, _) = broadcast::channel(256);
    (EventReporter::new(sink.clone(), tx), sink)
}

pub fn reading(on_battery: bool, charge: f32, runtime: u64) -> UpsTelemetry {
    let status = if on_battery { "OB DISCHRG" } else { "OL CHRG" };
    UpsTelemetry {
        on_battery,
        battery_charge_percent: charge,
        battery_runtime_secs: runtime,
        load_percent: Some(20.0),
        input_voltage: Some(if on_battery { 0.0 } else { 230.0 }),
        status_flags: status.split_whitespace().map(str::to_string).collect(),
    }
}

/// Telemetry source whose next reading the test sets
pub struct ScriptedTelemetry {
    reading: Mutex<Result<UpsTelemetry, String>>,
    pub fetches: AtomicUsize,
}

impl ScriptedTelemetry {
    pub fn new(initial: UpsTelemetry) -> Arc<Self> {
        Arc::new(Self {
            reading: Mutex::new(Ok(initial)),
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, telemetry: UpsTelemetry) {
        *self.reading.lock().unwrap() = Ok(telemetry);
    }

    pub fn fail(&self, reason: &str) {
        *self.reading.lock().unwrap() = Err(reason.to_string());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpsTelemetrySource for ScriptedTelemetry {
    fn ups_name(&self) -> &str {
        "ups@test"
    }

    async fn fetch(&self) -> Result<UpsTelemetry> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.reading.lock().unwrap().clone().map_err(|e| anyhow!(e))
    }
}

/// Shutdown actions that only count their invocations
#[derive(Default)]
pub struct CountingActions {
    pub stop_all: AtomicUsize,
    pub stopped: Mutex<Vec<Vec<String>>>,
    pub snapshots: AtomicUsize,
    pub flushes: AtomicUsize,
    pub fail_snapshots: AtomicBool,
    pub hang_stop_all: AtomicBool,
}

impl CountingActions {
    pub fn stop_all_count(&self) -> usize {
        self.stop_all.load(Ordering::SeqCst)
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> Vec<Vec<String>> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn total(&self) -> usize {
        self.stop_all_count() + self.snapshot_count() + self.flush_count() + self.stopped().len()
    }
}

#[async_trait]
impl ShutdownActions for CountingActions {
    async fn stop_all_containers(&self, _timeout: Duration) -> Result<ActionReport> {
        self.stop_all.fetch_add(1, Ordering::SeqCst);
        if self.hang_stop_all.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
        }
        Ok(ActionReport::default())
    }

    async fn stop_containers(&self, names: &[String], _timeout: Duration) -> Result<ActionReport> {
        self.stopped.lock().unwrap().push(names.to_vec());
        Ok(ActionReport {
            succeeded: names.to_vec(),
            failed: Vec::new(),
        })
    }

    async fn snapshot_online_pools(&self, _timeout: Duration) -> Result<ActionReport> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        if self.fail_snapshots.load(Ordering::SeqCst) {
            return Err(anyhow!("zpool: command not found"));
        }
        Ok(ActionReport::default())
    }

    async fn flush_filesystems(&self, _timeout: Duration) -> Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn power_config(enable_shutdown: bool) -> PowerConfig {
    PowerConfig {
        ups: "ups@test".to_string(),
        poll_interval: 30,
        on_battery_poll_interval: 5,
        critical_runtime_secs: 300,
        warning_runtime_secs: 600,
        low_battery_percent: 30.0,
        enable_shutdown,
        non_essential_containers: vec!["plex".to_string(), "sonarr".to_string()],
        ..PowerConfig::default()
    }
}

pub fn breaker_config(failure: u32, volume: u64, success: u32, open_timeout_ms: u64) -> BreakerConfig {
    BreakerConfig {
        failure_threshold: failure,
        success_threshold: success,
        open_timeout_ms,
        volume_threshold: volume,
    }
}

/// Probe whose outcome the test flips between sweeps
pub struct ToggleProbe {
    healthy: AtomicBool,
    pub calls: AtomicUsize,
}

impl ToggleProbe {
    pub fn new(healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(healthy),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DependencyProbe for ToggleProbe {
    async fn probe(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("connection refused"))
        }
    }
}

/// Probe that never answers
pub struct HangingProbe;

#[async_trait]
impl DependencyProbe for HangingProbe {
    async fn probe(&self) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
        Ok(())
    }
}

/// Worker with controllable liveness that counts restarts
#[derive(Default)]
pub struct FakeWorker {
    running: AtomicBool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl FakeWorker {
    pub fn new(running: bool) -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(running),
            ..Self::default()
        })
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LivenessCheckable for FakeWorker {
    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Startable for FakeWorker {
    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Stoppable for FakeWorker {
    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
