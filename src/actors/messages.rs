//! Message types for actor communication
//!
//! This module defines the records the monitoring core produces and the command
//! messages used to control the actors.
//!
//! ## Design Principles
//!
//! 1. **Commands**: Request/response messages sent to specific actors via mpsc
//! 2. **Events**: Broadcast notifications published to multiple subscribers
//! 3. **Immutability**: All records are cloneable for multi-subscriber patterns

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::breaker::{BreakerMetrics, CircuitPhase};

/// What kind of thing a [`ServiceHealth`] record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// The local database (liveness query)
    Database,

    /// An external dependency probed through a circuit breaker
    Dependency,

    /// A long-running worker polled via `is_running()`
    Worker,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Database => write!(f, "database"),
            ServiceKind::Dependency => write!(f, "dependency"),
            ServiceKind::Worker => write!(f, "worker"),
        }
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database" => Ok(ServiceKind::Database),
            "dependency" => Ok(ServiceKind::Dependency),
            "worker" => Ok(ServiceKind::Worker),
            other => Err(format!("unknown service kind '{other}'")),
        }
    }
}

/// Health of one probed service
///
/// Created on the first probe of a service and updated in place on every
/// following probe. Records are never removed while the process lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub service_name: String,
    pub kind: ServiceKind,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_check_at: DateTime<Utc>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,

    /// Phase of the breaker wrapping this service's probe, if any
    pub circuit_phase: Option<CircuitPhase>,

    /// Restart attempts since the last successful probe
    pub restart_attempts: u32,

    /// The restart budget is used up; no more restarts until reset
    pub restarts_exhausted: bool,
}

impl ServiceHealth {
    pub fn new(service_name: impl Into<String>, kind: ServiceKind) -> Self {
        Self {
            service_name: service_name.into(),
            kind,
            healthy: false,
            consecutive_failures: 0,
            last_check_at: Utc::now(),
            last_success_at: None,
            last_failure_at: None,
            error_message: None,
            circuit_phase: None,
            restart_attempts: 0,
            restarts_exhausted: false,
        }
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.healthy = true;
        self.consecutive_failures = 0;
        self.last_check_at = now;
        self.last_success_at = Some(now);
        self.error_message = None;
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>, error: impl Into<String>) {
        self.healthy = false;
        self.consecutive_failures += 1;
        self.last_check_at = now;
        self.last_failure_at = Some(now);
        self.error_message = Some(error.into());
    }

    /// A short-circuited probe: unhealthy, but not counted as a failure
    pub fn record_rejection(&mut self, now: DateTime<Utc>, reason: impl Into<String>) {
        self.healthy = false;
        self.last_check_at = now;
        self.error_message = Some(reason.into());
    }
}

/// Health record joined with the metrics of its breaker
#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    #[serde(flatten)]
    pub health: ServiceHealth,

    pub breaker: Option<BreakerMetrics>,
}

/// The state the restart supervisor exposes to the outside
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,

    /// `true` iff every service is healthy
    pub healthy: bool,

    pub services: Vec<ServiceReport>,
}

impl HealthReport {
    pub fn service(&self, name: &str) -> Option<&ServiceReport> {
        self.services
            .iter()
            .find(|service| service.health.service_name == name)
    }
}

/// One telemetry sample of the power supply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSample {
    pub timestamp: DateTime<Utc>,
    pub ups_name: String,
    pub on_battery: bool,
    pub battery_charge_percent: f32,
    pub battery_runtime_secs: u64,
    pub load_percent: Option<f32>,
    pub input_voltage: Option<f32>,
    pub status_flags: Vec<String>,
}

/// Kind of power state transition written to the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerEventType {
    PowerLoss,
    PowerRestored,
    LowBatteryWarning,
    GracefulShutdownInitiated,
    EmergencyShutdownInitiated,
}

impl fmt::Display for PowerEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PowerEventType::PowerLoss => "power_loss",
            PowerEventType::PowerRestored => "power_restored",
            PowerEventType::LowBatteryWarning => "low_battery_warning",
            PowerEventType::GracefulShutdownInitiated => "graceful_shutdown_initiated",
            PowerEventType::EmergencyShutdownInitiated => "emergency_shutdown_initiated",
        };
        write!(f, "{name}")
    }
}

impl FromStr for PowerEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "power_loss" => Ok(PowerEventType::PowerLoss),
            "power_restored" => Ok(PowerEventType::PowerRestored),
            "low_battery_warning" => Ok(PowerEventType::LowBatteryWarning),
            "graceful_shutdown_initiated" => Ok(PowerEventType::GracefulShutdownInitiated),
            "emergency_shutdown_initiated" => Ok(PowerEventType::EmergencyShutdownInitiated),
            other => Err(format!("unknown power event type '{other}'")),
        }
    }
}

/// Append-only audit entry for a power state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerEventRecord {
    pub timestamp: DateTime<Utc>,
    pub event_type: PowerEventType,
    pub battery_percent: f32,
    pub runtime_remaining: u64,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    High,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::High => write!(f, "high"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for AlertSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(AlertSeverity::Info),
            "warning" => Ok(AlertSeverity::Warning),
            "high" => Ok(AlertSeverity::High),
            "critical" => Ok(AlertSeverity::Critical),
            other => Err(format!("unknown alert severity '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,

    /// Component that raised the alert (e.g. "supervisor", "power")
    pub source: String,

    pub title: String,
    pub message: String,
}

/// Event published on the monitoring bus
///
/// The broadcast channel may lag or drop messages for slow subscribers. Every
/// event is also handed to the persistence sink, so the bus is best effort.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    ServiceHealth(ServiceHealth),
    PowerSample(PowerSample),
    PowerEvent(PowerEventRecord),
    Alert(Alert),
}

impl MonitorEvent {
    /// Topic name used by subscribers to filter events
    pub fn topic(&self) -> &'static str {
        match self {
            MonitorEvent::ServiceHealth(_) => "service_health",
            MonitorEvent::PowerSample(_) => "power_sample",
            MonitorEvent::PowerEvent(_) => "power_event",
            MonitorEvent::Alert(_) => "alert",
        }
    }
}

/// Commands that can be sent to the SupervisorActor
#[derive(Debug)]
pub enum SupervisorCommand {
    /// Run one sweep immediately (bypassing the interval timer)
    SweepNow {
        respond_to: oneshot::Sender<HealthReport>,
    },

    /// Get the current health report without probing
    GetReport {
        respond_to: oneshot::Sender<HealthReport>,
    },

    /// Administrative reset of a service's restart attempt counter
    ResetRestartAttempts { service_name: String },

    /// Force a dependency's breaker back to closed
    ResetBreaker {
        dependency: String,
        respond_to: oneshot::Sender<bool>,
    },
}

/// Commands that can be sent to the PowerActor
#[derive(Debug)]
pub enum PowerCommand {
    /// Poll the UPS immediately and evaluate the result
    PollNow {
        respond_to: oneshot::Sender<anyhow::Result<crate::actors::power::PowerState>>,
    },

    /// Get the controller's current view of the power state
    GetState {
        respond_to: oneshot::Sender<crate::actors::power::PowerState>,
    },
}

/// Commands that can be sent to the StorageActor
#[derive(Debug)]
pub enum StorageCommand {
    /// Persist a single record
    Record(StorageRecord),

    /// Resolves once every record queued before it has been written
    Flush {
        respond_to: oneshot::Sender<anyhow::Result<()>>,
    },

    /// Get storage statistics
    GetStats {
        respond_to: oneshot::Sender<StorageStats>,
    },

    /// Gracefully shut down the storage actor
    Shutdown,
}

/// A record queued for persistence
#[derive(Debug, Clone)]
pub enum StorageRecord {
    ServiceHealth(ServiceHealth),
    PowerSample(PowerSample),
    PowerEvent(PowerEventRecord),
    Alert(Alert),
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    /// Records written successfully
    pub records_written: u64,

    /// Records the backend rejected
    pub write_failures: u64,

    /// Records deleted by retention cleanup
    pub records_deleted: u64,
}
