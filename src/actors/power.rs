//! PowerActor - UPS monitoring and shutdown escalation
//!
//! Polls UPS telemetry on its own timer, records every sample, and walks an
//! escalating, idempotent shutdown sequence while the host runs on battery.
//!
//! ## Tiers
//!
//! Evaluated top to bottom on every on-battery poll; the first tier that is
//! both triggered and still armed fires, and only that one:
//!
//! | Tier        | Trigger                          | Action                                   |
//! |-------------|----------------------------------|------------------------------------------|
//! | Critical    | runtime < `critical_runtime_secs` | stop all containers, snapshot, sync      |
//! | Warning     | runtime < `warning_runtime_secs`  | snapshot, stop non-essential containers  |
//! | Low battery | charge < `low_battery_percent`    | alert only                               |
//!
//! Each tier has a one-shot guard that re-arms only when mains power returns.
//! The emergency tier also disarms the graceful one. With `enable_shutdown`
//! off the destructive steps are skipped but alerts and events still go out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};

use super::messages::{AlertSeverity, PowerCommand, PowerEventRecord, PowerEventType};
use crate::actions::{ActionReport, ShutdownActions};
use crate::alerts::EventReporter;
use crate::config::PowerConfig;
use crate::ups::{UpsTelemetry, UpsTelemetrySource};

const ALERT_SOURCE: &str = "power";

/// Consecutive failed polls before the telemetry outage is alerted
pub const TELEMETRY_FAILURE_ALERT_THRESHOLD: u32 = 3;

/// The controller's view of the power supply
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PowerState {
    pub on_battery: bool,
    pub battery_charge_percent: f32,
    pub battery_runtime_secs: u64,

    pub graceful_triggered: bool,
    pub emergency_triggered: bool,
    pub low_battery_alerted: bool,

    pub last_sample_at: Option<DateTime<Utc>>,
    pub consecutive_telemetry_failures: u32,
}

impl PowerState {
    fn clear_guards(&mut self) {
        self.graceful_triggered = false;
        self.emergency_triggered = false;
        self.low_battery_alerted = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerTier {
    Critical,
    Warning,
    LowBattery,
}

/// Evaluation order; earlier tiers pre-empt later ones
pub const TIER_PRIORITY: [PowerTier; 3] =
    [PowerTier::Critical, PowerTier::Warning, PowerTier::LowBattery];

impl PowerTier {
    fn triggered(self, state: &PowerState, config: &PowerConfig) -> bool {
        match self {
            PowerTier::Critical => state.battery_runtime_secs < config.critical_runtime_secs,
            PowerTier::Warning => state.battery_runtime_secs < config.warning_runtime_secs,
            PowerTier::LowBattery => state.battery_charge_percent < config.low_battery_percent,
        }
    }

    fn armed(self, state: &PowerState) -> bool {
        match self {
            PowerTier::Critical => !state.emergency_triggered,
            PowerTier::Warning => !state.graceful_triggered,
            PowerTier::LowBattery => !state.graceful_triggered && !state.low_battery_alerted,
        }
    }
}

/// The tier that should act for `state`, if any
pub fn select_tier(state: &PowerState, config: &PowerConfig) -> Option<PowerTier> {
    if !state.on_battery {
        return None;
    }

    TIER_PRIORITY
        .into_iter()
        .find(|tier| tier.triggered(state, config) && tier.armed(state))
}

fn poll_ticker(period: Duration) -> Interval {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Cap a shutdown step at `limit`, whatever the collaborator does with its timeout
async fn bounded<T>(limit: Duration, step: impl Future<Output = Result<T>>) -> Result<T> {
    time::timeout(limit, step)
        .await
        .unwrap_or_else(|_| Err(anyhow!("timed out after {limit:?}")))
}

fn log_step(step: &str, result: Result<ActionReport>) {
    match result {
        Ok(report) if report.is_complete() => {
            info!("{step}: {} succeeded", report.succeeded.len());
        }
        Ok(report) => {
            warn!(
                "{step}: {} succeeded, {} failed ({:?})",
                report.succeeded.len(),
                report.failed.len(),
                report.failed
            );
        }
        Err(e) => error!("{step} failed: {e:#}"),
    }
}

pub struct PowerActor {
    config: PowerConfig,
    telemetry: Arc<dyn UpsTelemetrySource>,
    actions: Arc<dyn ShutdownActions>,
    reporter: EventReporter,
    state: PowerState,
    command_rx: mpsc::Receiver<PowerCommand>,
    stop_rx: watch::Receiver<bool>,
}

impl PowerActor {
    pub fn new(
        config: PowerConfig,
        telemetry: Arc<dyn UpsTelemetrySource>,
        actions: Arc<dyn ShutdownActions>,
        reporter: EventReporter,
        command_rx: mpsc::Receiver<PowerCommand>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            telemetry,
            actions,
            reporter,
            state: PowerState::default(),
            command_rx,
            stop_rx,
        }
    }

    fn current_period(&self) -> Duration {
        if self.state.on_battery {
            self.config.on_battery_poll_interval()
        } else {
            self.config.poll_interval()
        }
    }

    /// Run the actor's main loop
    #[instrument(skip(self), fields(ups = %self.config.ups))]
    pub async fn run(mut self) {
        info!(
            "starting power controller (shutdown {})",
            if self.config.enable_shutdown {
                "enabled"
            } else {
                "disabled, dry run"
            }
        );

        let mut period = self.current_period();
        let mut ticker = poll_ticker(period);
        let mut stop_rx = self.stop_rx.clone();

        loop {
            tokio::select! {
                biased;

                _ = super::stop_requested(&mut stop_rx) => {
                    debug!("stop requested");
                    break;
                }

                _ = ticker.tick() => {
                    match self.poll_or_stop(&mut stop_rx).await {
                        None => break,
                        Some(Err(e)) => warn!("UPS poll failed: {e:#}"),
                        Some(Ok(_)) => trace!("UPS poll complete"),
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(PowerCommand::PollNow { respond_to }) => {
                            match self.poll_or_stop(&mut stop_rx).await {
                                None => {
                                    let _ = respond_to.send(Err(anyhow!("power controller stopped")));
                                    break;
                                }
                                Some(result) => {
                                    let _ = respond_to.send(result);
                                }
                            }
                        }
                        Some(PowerCommand::GetState { respond_to }) => {
                            let _ = respond_to.send(self.state.clone());
                        }
                        None => {
                            debug!("all power handles dropped");
                            break;
                        }
                    }
                }
            }

            let wanted = self.current_period();
            if wanted != period {
                debug!("poll interval {period:?} -> {wanted:?}");
                period = wanted;
                ticker = poll_ticker(period);
            }
        }

        info!("power controller stopped");
    }

    /// `None` if a stop arrived before the poll finished
    async fn poll_or_stop(
        &mut self,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Option<Result<PowerState>> {
        tokio::select! {
            biased;

            _ = super::stop_requested(stop_rx) => {
                debug!("stop requested, abandoning poll");
                None
            }

            result = self.poll() => Some(result),
        }
    }

    async fn poll(&mut self) -> Result<PowerState> {
        let timeout = self.config.telemetry_timeout();
        let telemetry = match time::timeout(timeout, self.telemetry.fetch()).await {
            Ok(Ok(telemetry)) => telemetry,
            Ok(Err(e)) => return Err(self.telemetry_failed(e)),
            Err(_) => {
                return Err(self.telemetry_failed(anyhow!("telemetry timed out after {timeout:?}")));
            }
        };

        if self.state.consecutive_telemetry_failures >= TELEMETRY_FAILURE_ALERT_THRESHOLD {
            info!("UPS telemetry available again");
        }
        self.state.consecutive_telemetry_failures = 0;

        let now = Utc::now();
        self.reporter
            .power_sample(telemetry.to_sample(self.telemetry.ups_name(), now));

        self.state.battery_charge_percent = telemetry.battery_charge_percent;
        self.state.battery_runtime_secs = telemetry.battery_runtime_secs;
        self.state.last_sample_at = Some(now);

        self.observe_supply(&telemetry);

        if let Some(tier) = select_tier(&self.state, &self.config) {
            self.fire(tier).await;
        }

        Ok(self.state.clone())
    }

    fn telemetry_failed(&mut self, error: anyhow::Error) -> anyhow::Error {
        self.state.consecutive_telemetry_failures += 1;

        if self.state.consecutive_telemetry_failures == TELEMETRY_FAILURE_ALERT_THRESHOLD {
            self.reporter.alert(
                AlertSeverity::Warning,
                ALERT_SOURCE,
                "UPS telemetry unavailable",
                format!(
                    "{} consecutive polls of {} failed: {error:#}",
                    TELEMETRY_FAILURE_ALERT_THRESHOLD, self.config.ups
                ),
            );
        }

        error
    }

    /// Record mains/battery transitions
    fn observe_supply(&mut self, telemetry: &UpsTelemetry) {
        match (self.state.on_battery, telemetry.on_battery) {
            (false, true) => {
                self.state.on_battery = true;
                self.reporter.alert(
                    AlertSeverity::High,
                    ALERT_SOURCE,
                    "Power lost",
                    format!(
                        "running on battery: {:.0}% charge, {}s runtime",
                        telemetry.battery_charge_percent, telemetry.battery_runtime_secs
                    ),
                );
                self.record_event(
                    PowerEventType::PowerLoss,
                    json!({ "status_flags": telemetry.status_flags }),
                );
            }
            (true, false) => {
                self.state.on_battery = false;
                self.state.clear_guards();
                self.reporter.alert(
                    AlertSeverity::Info,
                    ALERT_SOURCE,
                    "Power restored",
                    format!(
                        "mains power is back at {:.0}% charge",
                        telemetry.battery_charge_percent
                    ),
                );
                self.record_event(
                    PowerEventType::PowerRestored,
                    json!({ "status_flags": telemetry.status_flags }),
                );
            }
            _ => {}
        }
    }

    fn record_event(&self, event_type: PowerEventType, details: serde_json::Value) {
        self.reporter.power_event(PowerEventRecord {
            timestamp: Utc::now(),
            event_type,
            battery_percent: self.state.battery_charge_percent,
            runtime_remaining: self.state.battery_runtime_secs,
            details,
        });
    }

    async fn fire(&mut self, tier: PowerTier) {
        let dry_run = !self.config.enable_shutdown;
        let runtime = self.state.battery_runtime_secs;

        match tier {
            PowerTier::Critical => {
                self.state.emergency_triggered = true;
                self.state.graceful_triggered = true;

                self.reporter.alert(
                    AlertSeverity::Critical,
                    ALERT_SOURCE,
                    "Emergency shutdown",
                    format!(
                        "battery runtime {runtime}s is below {}s; stopping all containers",
                        self.config.critical_runtime_secs
                    ),
                );
                self.record_event(
                    PowerEventType::EmergencyShutdownInitiated,
                    json!({
                        "dry_run": dry_run,
                        "runtime_secs": runtime,
                        "threshold_secs": self.config.critical_runtime_secs,
                        "actions": ["stop_all_containers", "snapshot_online_pools", "flush_filesystems"],
                    }),
                );

                if dry_run {
                    info!("dry run: skipping emergency shutdown sequence");
                } else {
                    self.emergency_sequence().await;
                }
            }
            PowerTier::Warning => {
                self.state.graceful_triggered = true;

                self.reporter.alert(
                    AlertSeverity::High,
                    ALERT_SOURCE,
                    "Graceful shutdown",
                    format!(
                        "battery runtime {runtime}s is below {}s; shedding non-essential load",
                        self.config.warning_runtime_secs
                    ),
                );
                self.record_event(
                    PowerEventType::GracefulShutdownInitiated,
                    json!({
                        "dry_run": dry_run,
                        "runtime_secs": runtime,
                        "threshold_secs": self.config.warning_runtime_secs,
                        "containers": self.config.non_essential_containers,
                    }),
                );

                if dry_run {
                    info!("dry run: skipping graceful shutdown sequence");
                } else {
                    self.graceful_sequence().await;
                }
            }
            PowerTier::LowBattery => {
                self.state.low_battery_alerted = true;

                self.reporter.alert(
                    AlertSeverity::Warning,
                    ALERT_SOURCE,
                    "Low battery",
                    format!(
                        "battery charge {:.0}% is below {:.0}%",
                        self.state.battery_charge_percent, self.config.low_battery_percent
                    ),
                );
                self.record_event(
                    PowerEventType::LowBatteryWarning,
                    json!({
                        "charge_percent": self.state.battery_charge_percent,
                        "threshold_percent": self.config.low_battery_percent,
                    }),
                );
            }
        }
    }

    /// Every step runs regardless of how the previous one went
    async fn emergency_sequence(&self) {
        let timeout = self.config.action_timeout();
        warn!("running emergency shutdown sequence");

        log_step(
            "stop all containers",
            bounded(timeout, self.actions.stop_all_containers(timeout)).await,
        );
        log_step(
            "snapshot online pools",
            bounded(timeout, self.actions.snapshot_online_pools(timeout)).await,
        );

        match bounded(timeout, self.actions.flush_filesystems(timeout)).await {
            Ok(()) => info!("filesystems flushed"),
            Err(e) => error!("flushing filesystems failed: {e:#}"),
        }
    }

    async fn graceful_sequence(&self) {
        let timeout = self.config.action_timeout();
        warn!("running graceful shutdown sequence");

        log_step(
            "snapshot online pools",
            bounded(timeout, self.actions.snapshot_online_pools(timeout)).await,
        );
        log_step(
            "stop non-essential containers",
            bounded(
                timeout,
                self.actions
                    .stop_containers(&self.config.non_essential_containers, timeout),
            )
            .await,
        );
    }
}

/// Handle for interacting with the PowerActor
#[derive(Clone)]
pub struct PowerHandle {
    sender: mpsc::Sender<PowerCommand>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl PowerHandle {
    /// Spawn the controller; the first scheduled poll runs one interval from now
    pub fn spawn(
        config: PowerConfig,
        telemetry: Arc<dyn UpsTelemetrySource>,
        actions: Arc<dyn ShutdownActions>,
        reporter: EventReporter,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (stop_tx, stop_rx) = watch::channel(false);

        let actor = PowerActor::new(config, telemetry, actions, reporter, cmd_rx, stop_rx);
        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            stop_tx: Arc::new(stop_tx),
        }
    }

    /// Poll the UPS now and return the resulting state
    pub async fn poll_now(&self) -> Result<PowerState> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PowerCommand::PollNow { respond_to: tx })
            .await
            .map_err(|_| anyhow!("power controller stopped"))?;

        rx.await.map_err(|_| anyhow!("power controller stopped"))?
    }

    pub async fn state(&self) -> Result<PowerState> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PowerCommand::GetState { respond_to: tx })
            .await
            .map_err(|_| anyhow!("power controller stopped"))?;

        rx.await.map_err(|_| anyhow!("power controller stopped"))
    }

    /// Stop polling; an in-flight poll (and its shutdown sequence) is abandoned
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}
