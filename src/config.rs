use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tracing::trace;

use crate::util::{get_enable_shutdown, get_max_restart_attempts};

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default for most deployments)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,

        /// Retention period in days for samples and alerts
        #[serde(default = "default_retention_days")]
        retention_days: u32,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./homewatch.db")
}

fn default_retention_days() -> u32 {
    30
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    /// Storage configuration (optional - defaults to sqlite)
    pub storage: Option<StorageConfig>,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub dependencies: Vec<DependencyConfig>,

    #[serde(default)]
    pub workers: Vec<WorkerConfig>,

    /// UPS monitoring is disabled when absent
    pub power: Option<PowerConfig>,
}

impl Config {
    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.supervisor.breaker.validate("default")?;

        for dependency in &self.dependencies {
            if let Some(breaker) = &dependency.breaker {
                breaker.validate(&dependency.name)?;
            }

            if let Some(target) = &dependency.restart_target
                && !self.workers.iter().any(|worker| &worker.name == target)
            {
                return Err(ConfigError::UnknownRestartTarget {
                    dependency: dependency.name.clone(),
                    target: target.clone(),
                });
            }
        }

        if let Some(power) = &self.power {
            power.validate()?;
        }

        Ok(())
    }

    /// Environment variables win over the file
    fn apply_env_overrides(&mut self) {
        if let Some(attempts) = get_max_restart_attempts() {
            self.supervisor.max_restart_attempts = attempts;
        }

        if let Some(power) = &mut self.power
            && let Some(enable) = get_enable_shutdown()
        {
            power.enable_shutdown = enable;
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SupervisorConfig {
    /// Sweep interval in seconds
    #[serde(default = "default_sweep_interval")]
    pub interval: u64,

    /// Per-probe timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,

    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,

    /// Base of the exponential restart backoff in seconds
    #[serde(default = "default_restart_base_delay")]
    pub restart_base_delay: u64,

    /// Start/stop timeout for worker restarts in seconds
    #[serde(default = "default_restart_timeout")]
    pub restart_timeout: u64,

    /// Breaker settings for dependencies without their own
    #[serde(default)]
    pub breaker: BreakerConfig,
}

impl SupervisorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout)
    }

    pub fn restart_base_delay(&self) -> Duration {
        Duration::from_secs(self.restart_base_delay)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval: default_sweep_interval(),
            probe_timeout: default_probe_timeout(),
            max_restart_attempts: default_max_restart_attempts(),
            restart_base_delay: default_restart_base_delay(),
            restart_timeout: default_restart_timeout(),
            breaker: BreakerConfig::default(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_max_restart_attempts() -> u32 {
    3
}

fn default_restart_base_delay() -> u64 {
    5
}

fn default_restart_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Minimum number of requests before the breaker may trip
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold: u64,
}

impl BreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let zero = [
            ("failure_threshold", self.failure_threshold == 0),
            ("success_threshold", self.success_threshold == 0),
            ("volume_threshold", self.volume_threshold == 0),
        ];

        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((field, _)) => Err(ConfigError::InvalidBreaker {
                name: name.to_string(),
                reason: format!("{field} must be at least 1"),
            }),
            None => Ok(()),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
            volume_threshold: default_volume_threshold(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_timeout_ms() -> u64 {
    60_000
}

fn default_volume_threshold() -> u64 {
    10
}

/// An external dependency probed through its own breaker
#[derive(Debug, Clone, serde::Deserialize)]
pub struct DependencyConfig {
    pub name: String,
    pub probe: ProbeConfig,

    /// Overrides `supervisor.breaker`
    pub breaker: Option<BreakerConfig>,

    /// Worker restarted when this dependency's breaker opens
    pub restart_target: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeConfig {
    Http {
        url: String,
        #[serde(default)]
        method: HttpMethod,
        expected_status: Option<Vec<u16>>,
        body_pattern: Option<String>,
    },
    Command(CommandSpec),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Head,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A long-running worker driven by shell commands
#[derive(Debug, Clone, serde::Deserialize)]
pub struct WorkerConfig {
    pub name: String,

    /// Exit status 0 means running
    pub is_running: CommandSpec,
    pub start: Option<CommandSpec>,
    pub stop: Option<CommandSpec>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PowerConfig {
    /// NUT identifier passed to `upsc` (e.g. "ups@localhost")
    #[serde(default = "default_ups")]
    pub ups: String,

    /// Poll interval on mains power, in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Poll interval while on battery, in seconds
    #[serde(default = "default_on_battery_poll_interval")]
    pub on_battery_poll_interval: u64,

    #[serde(default = "default_critical_runtime_secs")]
    pub critical_runtime_secs: u64,

    #[serde(default = "default_warning_runtime_secs")]
    pub warning_runtime_secs: u64,

    #[serde(default = "default_low_battery_percent")]
    pub low_battery_percent: f32,

    /// When false, shutdown tiers only alert and record (dry run)
    #[serde(default)]
    pub enable_shutdown: bool,

    /// Containers stopped by the graceful tier
    #[serde(default)]
    pub non_essential_containers: Vec<String>,

    /// Timeout for each destructive action, in seconds
    #[serde(default = "default_action_timeout")]
    pub action_timeout: u64,

    #[serde(default = "default_telemetry_timeout")]
    pub telemetry_timeout: u64,
}

impl PowerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn on_battery_poll_interval(&self) -> Duration {
        Duration::from_secs(self.on_battery_poll_interval)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout)
    }

    pub fn telemetry_timeout(&self) -> Duration {
        Duration::from_secs(self.telemetry_timeout)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.critical_runtime_secs >= self.warning_runtime_secs {
            return Err(ConfigError::InvalidPower(format!(
                "critical_runtime_secs ({}) must be below warning_runtime_secs ({})",
                self.critical_runtime_secs, self.warning_runtime_secs
            )));
        }

        if self.poll_interval == 0 || self.on_battery_poll_interval == 0 {
            return Err(ConfigError::InvalidPower(
                "poll intervals must be at least one second".to_string(),
            ));
        }

        if !(0.0..=100.0).contains(&self.low_battery_percent) {
            return Err(ConfigError::InvalidPower(format!(
                "low_battery_percent ({}) must be between 0 and 100",
                self.low_battery_percent
            )));
        }

        Ok(())
    }
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            ups: default_ups(),
            poll_interval: default_poll_interval(),
            on_battery_poll_interval: default_on_battery_poll_interval(),
            critical_runtime_secs: default_critical_runtime_secs(),
            warning_runtime_secs: default_warning_runtime_secs(),
            low_battery_percent: default_low_battery_percent(),
            enable_shutdown: false,
            non_essential_containers: Vec::new(),
            action_timeout: default_action_timeout(),
            telemetry_timeout: default_telemetry_timeout(),
        }
    }
}

fn default_ups() -> String {
    "ups@localhost".to_string()
}

fn default_poll_interval() -> u64 {
    30
}

fn default_on_battery_poll_interval() -> u64 {
    5
}

fn default_critical_runtime_secs() -> u64 {
    300
}

fn default_warning_runtime_secs() -> u64 {
    600
}

fn default_low_battery_percent() -> f32 {
    30.0
}

fn default_action_timeout() -> u64 {
    60
}

fn default_telemetry_timeout() -> u64 {
    10
}

/// Configuration rejected at load time
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    InvalidBreaker { name: String, reason: String },
    InvalidPower(String),
    UnknownRestartTarget { dependency: String, target: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidBreaker { name, reason } => {
                write!(f, "invalid breaker configuration for '{name}': {reason}")
            }
            ConfigError::InvalidPower(reason) => {
                write!(f, "invalid power configuration: {reason}")
            }
            ConfigError::UnknownRestartTarget { dependency, target } => write!(
                f,
                "dependency '{dependency}' names unknown restart target '{target}'"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn parse_config(content: &str) -> anyhow::Result<Config> {
    let mut config: Config = serde_json::from_str(content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    parse_config(&file_content).inspect(|config| trace!("loaded config: {config:?}"))
}
