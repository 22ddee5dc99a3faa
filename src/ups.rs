//! UPS telemetry via Network UPS Tools
//!
//! `upsc <ups>` prints one `key: value` pair per line:
//!
//! ```text
//! battery.charge: 87
//! battery.runtime: 1260
//! input.voltage: 231.0
//! ups.load: 23
//! ups.status: OB DISCHRG
//! ```
//!
//! `OL` in `ups.status` means on line (mains), `OB` means on battery.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::actors::messages::PowerSample;
use crate::config::CommandSpec;
use crate::process;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsTelemetry {
    pub on_battery: bool,
    pub battery_charge_percent: f32,
    pub battery_runtime_secs: u64,
    pub load_percent: Option<f32>,
    pub input_voltage: Option<f32>,
    pub status_flags: Vec<String>,
}

impl UpsTelemetry {
    /// Parse the output of `upsc`
    pub fn parse_upsc(output: &str) -> Result<Self> {
        let values: HashMap<&str, &str> = output
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim(), value.trim()))
            .collect();

        let status = values
            .get("ups.status")
            .ok_or_else(|| anyhow!("missing ups.status"))?;
        let status_flags: Vec<String> = status.split_whitespace().map(str::to_string).collect();
        let on_battery = status_flags.iter().any(|flag| flag == "OB");

        let battery_charge_percent = required(&values, "battery.charge")?;
        let runtime: f64 = required(&values, "battery.runtime")?;

        Ok(Self {
            on_battery,
            battery_charge_percent,
            battery_runtime_secs: runtime.max(0.0) as u64,
            load_percent: optional(&values, "ups.load"),
            input_voltage: optional(&values, "input.voltage"),
            status_flags,
        })
    }

    pub fn to_sample(&self, ups_name: &str, timestamp: DateTime<Utc>) -> PowerSample {
        PowerSample {
            timestamp,
            ups_name: ups_name.to_string(),
            on_battery: self.on_battery,
            battery_charge_percent: self.battery_charge_percent,
            battery_runtime_secs: self.battery_runtime_secs,
            load_percent: self.load_percent,
            input_voltage: self.input_voltage,
            status_flags: self.status_flags.clone(),
        }
    }
}

fn required<T>(values: &HashMap<&str, &str>, key: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = values.get(key).ok_or_else(|| anyhow!("missing {key}"))?;
    raw.parse().with_context(|| format!("invalid {key}: '{raw}'"))
}

fn optional<T: std::str::FromStr>(values: &HashMap<&str, &str>, key: &str) -> Option<T> {
    values.get(key).and_then(|raw| raw.parse().ok())
}

#[async_trait]
pub trait UpsTelemetrySource: Send + Sync {
    /// Name of the monitored UPS, used on samples
    fn ups_name(&self) -> &str;

    async fn fetch(&self) -> Result<UpsTelemetry>;
}

/// Reads telemetry with the `upsc` client
pub struct NutClient {
    ups: String,
    timeout: Duration,
}

impl NutClient {
    pub fn new(ups: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ups: ups.into(),
            timeout,
        }
    }
}

#[async_trait]
impl UpsTelemetrySource for NutClient {
    fn ups_name(&self) -> &str {
        &self.ups
    }

    async fn fetch(&self) -> Result<UpsTelemetry> {
        let spec = CommandSpec::new("upsc", &[self.ups.as_str()]);
        let output = process::run_with_timeout(&spec, self.timeout).await?;
        UpsTelemetry::parse_upsc(&output).with_context(|| format!("unreadable telemetry from {}", self.ups))
    }
}
