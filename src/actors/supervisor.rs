//! SupervisorActor - Keeps dependencies and workers healthy
//!
//! Every sweep probes, concurrently:
//!
//! 1. the local database (liveness query, no breaker)
//! 2. each registered dependency, through that dependency's circuit breaker
//! 3. each registered worker's `is_running()`
//!
//! Outcomes are applied one at a time by the actor as they resolve, so the
//! health records, the restart counters and the breakers have a single writer.
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick ─┐
//!             ├→ sweep → probes (concurrent) → apply outcome → ServiceHealth → [sink, bus]
//! SweepNow ───┘                                      │
//!                                                    └→ restart(worker) → stop, backoff, start
//! ```
//!
//! Restarts run as background tasks owned by the actor. A worker gets at most
//! `max_restart_attempts` restarts between two successful probes; once the
//! budget is spent it stays down until it recovers or an operator resets it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};

use super::messages::{
    AlertSeverity, HealthReport, ServiceHealth, ServiceKind, ServiceReport, SupervisorCommand,
};
use crate::alerts::EventReporter;
use crate::breaker::{BreakerError, CircuitBreaker, CircuitPhase};
use crate::config::{BreakerConfig, Config, ConfigError, SupervisorConfig};
use crate::probes::{DatabaseProbe, DependencyProbe, build_probe};
use crate::storage::StorageBackend;
use crate::workers::{Worker, build_worker};

/// Name of the health record for the local database
pub const DATABASE_SERVICE: &str = "database";

const ALERT_SOURCE: &str = "supervisor";

/// Delay before restart attempt `attempt` (0-based): `base × 2^attempt`
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// An external dependency and the breaker guarding its probe
pub struct Dependency {
    pub name: String,
    pub probe: Arc<dyn DependencyProbe>,
    pub breaker: Arc<CircuitBreaker>,

    /// Worker restarted when the breaker opens
    pub restart_target: Option<String>,
}

impl Dependency {
    pub fn new(
        name: impl Into<String>,
        probe: Arc<dyn DependencyProbe>,
        breaker: BreakerConfig,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let breaker = Arc::new(CircuitBreaker::new(name.clone(), breaker)?);

        Ok(Self {
            name,
            probe,
            breaker,
            restart_target: None,
        })
    }

    pub fn with_restart_target(mut self, worker: impl Into<String>) -> Self {
        self.restart_target = Some(worker.into());
        self
    }
}

/// Everything the supervisor watches
#[derive(Default)]
pub struct Registry {
    pub database: Option<Arc<dyn DependencyProbe>>,
    pub dependencies: Vec<Dependency>,
    pub workers: Vec<Worker>,
}

impl Registry {
    /// Build probes, breakers and workers from the configuration
    pub fn from_config(config: &Config, database: Option<Arc<dyn StorageBackend>>) -> Result<Self> {
        let timeout = config.supervisor.probe_timeout();
        let mut registry = Registry::default();

        if let Some(backend) = database {
            registry = registry.with_database(Arc::new(DatabaseProbe::new(backend)));
        }

        for dep in &config.dependencies {
            let breaker = dep
                .breaker
                .clone()
                .unwrap_or_else(|| config.supervisor.breaker.clone());
            let probe = build_probe(&dep.probe, timeout)
                .with_context(|| format!("failed to build probe for '{}'", dep.name))?;

            let mut dependency = Dependency::new(&dep.name, probe, breaker)?;
            dependency.restart_target = dep.restart_target.clone();
            registry = registry.with_dependency(dependency);
        }

        for worker in &config.workers {
            registry = registry.with_worker(build_worker(worker, timeout));
        }

        Ok(registry)
    }

    pub fn with_database(mut self, probe: Arc<dyn DependencyProbe>) -> Self {
        self.database = Some(probe);
        self
    }

    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_worker(mut self, worker: Worker) -> Self {
        self.workers.push(worker);
        self
    }
}

/// Result of one probe inside a sweep
enum ProbeOutcome {
    Database(Result<()>),
    Dependency {
        index: usize,
        result: Result<(), BreakerError<anyhow::Error>>,
    },
    Worker {
        index: usize,
        running: bool,
    },
}

async fn probe_with_timeout(probe: Arc<dyn DependencyProbe>, timeout: Duration) -> Result<()> {
    match time::timeout(timeout, probe.probe()).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("probe timed out after {timeout:?}")),
    }
}

/// Stop, wait out the backoff, start
///
/// Failures are logged only; the attempt counter already reflects the try.
async fn restart_worker(worker: Worker, delay: Duration, timeout: Duration) {
    let name = worker.name().to_string();

    if let Some(stopper) = worker.stopper() {
        match time::timeout(timeout, stopper.stop()).await {
            Ok(Ok(())) => debug!("stopped worker {name}"),
            Ok(Err(e)) => warn!("failed to stop worker {name}: {e:#}"),
            Err(_) => warn!("stopping worker {name} timed out after {timeout:?}"),
        }
    }

    trace!("waiting {delay:?} before starting worker {name}");
    time::sleep(delay).await;

    if let Some(starter) = worker.starter() {
        match time::timeout(timeout, starter.start()).await {
            Ok(Ok(())) => info!("started worker {name}"),
            Ok(Err(e)) => warn!("failed to start worker {name}: {e:#}"),
            Err(_) => warn!("starting worker {name} timed out after {timeout:?}"),
        }
    }
}

/// A scheduled stop/backoff/start sequence for one worker
struct PendingRestart {
    task: JoinHandle<()>,

    /// Dependency whose open breaker asked for it, `None` if the worker itself was down
    requested_by: Option<String>,
}

pub struct SupervisorActor {
    config: SupervisorConfig,
    registry: Registry,

    /// Health records keyed by service name
    health: BTreeMap<String, ServiceHealth>,

    /// Restart attempts since the last successful probe, keyed by worker name
    restart_attempts: HashMap<String, u32>,

    pending_restarts: HashMap<String, PendingRestart>,

    /// Workers whose exhausted budget was already alerted
    exhausted_alerted: HashSet<String>,

    reporter: EventReporter,
    command_rx: mpsc::Receiver<SupervisorCommand>,
    stop_rx: watch::Receiver<bool>,
}

impl SupervisorActor {
    pub fn new(
        config: SupervisorConfig,
        registry: Registry,
        reporter: EventReporter,
        command_rx: mpsc::Receiver<SupervisorCommand>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            registry,
            health: BTreeMap::new(),
            restart_attempts: HashMap::new(),
            pending_restarts: HashMap::new(),
            exhausted_alerted: HashSet::new(),
            reporter,
            command_rx,
            stop_rx,
        }
    }

    /// Run the actor's main loop
    #[instrument(skip(self), fields(interval = self.config.interval))]
    pub async fn run(mut self) {
        info!(
            "starting supervisor ({} dependencies, {} workers)",
            self.registry.dependencies.len(),
            self.registry.workers.len()
        );

        let period = self.config.interval();
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut stop_rx = self.stop_rx.clone();

        loop {
            tokio::select! {
                biased;

                _ = super::stop_requested(&mut stop_rx) => {
                    debug!("stop requested");
                    break;
                }

                _ = ticker.tick() => {
                    trace!("sweep tick");
                    self.sweep().await;
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            debug!("all supervisor handles dropped");
                            break;
                        }
                    }
                }
            }
        }

        for (name, pending) in self.pending_restarts.drain() {
            if !pending.task.is_finished() {
                debug!("aborting pending restart of {name}");
                pending.task.abort();
            }
        }

        info!("supervisor stopped");
    }

    async fn handle_command(&mut self, cmd: SupervisorCommand) {
        match cmd {
            SupervisorCommand::SweepNow { respond_to } => {
                self.sweep().await;
                let _ = respond_to.send(self.report());
            }
            SupervisorCommand::GetReport { respond_to } => {
                let _ = respond_to.send(self.report());
            }
            SupervisorCommand::ResetRestartAttempts { service_name } => {
                info!("restart attempts of {service_name} reset by operator");
                self.reset_restart_attempts(&service_name);
            }
            SupervisorCommand::ResetBreaker {
                dependency,
                respond_to,
            } => {
                let found = self.reset_breaker(&dependency);
                let _ = respond_to.send(found);
            }
        }
    }

    fn probe_futures(&self) -> FuturesUnordered<BoxFuture<'static, ProbeOutcome>> {
        let timeout = self.config.probe_timeout();
        let mut pending = FuturesUnordered::new();

        if let Some(probe) = &self.registry.database {
            let probe = probe.clone();
            pending.push(
                async move { ProbeOutcome::Database(probe_with_timeout(probe, timeout).await) }
                    .boxed(),
            );
        }

        for (index, dep) in self.registry.dependencies.iter().enumerate() {
            let probe = dep.probe.clone();
            let breaker = dep.breaker.clone();
            pending.push(
                async move {
                    let result = breaker
                        .execute(|| probe_with_timeout(probe, timeout))
                        .await;
                    ProbeOutcome::Dependency { index, result }
                }
                .boxed(),
            );
        }

        for (index, worker) in self.registry.workers.iter().enumerate() {
            let worker = worker.clone();
            pending.push(
                async move {
                    let running = time::timeout(timeout, worker.is_running())
                        .await
                        .unwrap_or(false);
                    ProbeOutcome::Worker { index, running }
                }
                .boxed(),
            );
        }

        pending
    }

    /// Probe everything once; abandoned if a stop arrives mid-sweep
    async fn sweep(&mut self) {
        let mut pending = self.probe_futures();
        let mut stop_rx = self.stop_rx.clone();

        loop {
            tokio::select! {
                biased;

                _ = super::stop_requested(&mut stop_rx) => {
                    debug!("stop requested, abandoning sweep ({} probes in flight)", pending.len());
                    return;
                }

                outcome = pending.next() => match outcome {
                    Some(outcome) => self.apply(outcome),
                    None => break,
                }
            }
        }

        trace!("sweep complete");
    }

    fn apply(&mut self, outcome: ProbeOutcome) {
        match outcome {
            ProbeOutcome::Database(result) => self.apply_database(result),
            ProbeOutcome::Dependency { index, result } => self.apply_dependency(index, result),
            ProbeOutcome::Worker { index, running } => self.apply_worker(index, running),
        }
    }

    fn apply_database(&mut self, result: Result<()>) {
        let now = Utc::now();
        let previous = self.health.get(DATABASE_SERVICE).cloned();
        let health = self
            .health
            .entry(DATABASE_SERVICE.to_string())
            .or_insert_with(|| ServiceHealth::new(DATABASE_SERVICE, ServiceKind::Database));

        match result {
            Ok(()) => health.record_success(now),
            Err(e) => {
                warn!("database liveness check failed: {e:#}");
                health.record_failure(now, format!("{e:#}"));
            }
        }

        self.publish(DATABASE_SERVICE, previous);
    }

    fn apply_dependency(&mut self, index: usize, result: Result<(), BreakerError<anyhow::Error>>) {
        let dep = &self.registry.dependencies[index];
        let name = dep.name.clone();
        let target = dep.restart_target.clone();
        let phase = dep.breaker.phase();

        let now = Utc::now();
        let previous = self.health.get(&name).cloned();
        let health = self
            .health
            .entry(name.clone())
            .or_insert_with(|| ServiceHealth::new(&name, ServiceKind::Dependency));
        health.circuit_phase = Some(phase);

        let mut breaker_open = false;
        match result {
            Ok(()) => {
                trace!("dependency {name} healthy");
                health.record_success(now);
            }
            Err(BreakerError::Open(rejection)) => {
                trace!("dependency {name} short-circuited");
                health.record_rejection(now, rejection.to_string());
            }
            Err(BreakerError::Failed(e)) => {
                debug!("dependency {name} probe failed: {e:#}");
                health.record_failure(now, format!("{e:#}"));
                breaker_open = phase == CircuitPhase::Open;
            }
        }
        let healthy = health.healthy;

        if let Some(target) = target {
            if healthy {
                self.cancel_restart_requested_by(&target, &name);
            } else if breaker_open {
                self.restart(&target, Some(&name));
            }
        }

        self.publish(&name, previous);
    }

    fn apply_worker(&mut self, index: usize, running: bool) {
        let name = self.registry.workers[index].name().to_string();
        let now = Utc::now();
        let previous = self.health.get(&name).cloned();
        let health = self
            .health
            .entry(name.clone())
            .or_insert_with(|| ServiceHealth::new(&name, ServiceKind::Worker));

        if running {
            health.record_success(now);
            self.reset_restart_attempts(&name);
        } else {
            health.record_failure(now, "worker is not running");
            self.restart(&name, None);
        }

        // The counter may have moved before this record existed
        self.sync_restart_state(&name);
        self.publish(&name, previous);
    }

    /// Schedule a restart unless one is pending or the budget is spent
    fn restart(&mut self, name: &str, requested_by: Option<&str>) {
        if let Some(pending) = self.pending_restarts.get(name)
            && !pending.task.is_finished()
        {
            trace!("restart of {name} already pending");
            return;
        }

        let Some(worker) = self
            .registry
            .workers
            .iter()
            .find(|worker| worker.name() == name)
            .cloned()
        else {
            warn!("cannot restart {name}: not a registered worker");
            return;
        };

        let attempts = self.restart_attempts.get(name).copied().unwrap_or(0);
        if attempts >= self.config.max_restart_attempts {
            warn!("{name} has used all {attempts} restart attempts, not restarting");
            if self.exhausted_alerted.insert(name.to_string()) {
                self.reporter.alert(
                    AlertSeverity::Critical,
                    ALERT_SOURCE,
                    format!("Restart budget exhausted: {name}"),
                    format!(
                        "{name} is still down after {attempts} restarts; no further restarts \
                         until it recovers or the counter is reset"
                    ),
                );
            }
            self.sync_restart_state(name);
            return;
        }

        self.restart_attempts.insert(name.to_string(), attempts + 1);
        let delay = backoff_delay(self.config.restart_base_delay(), attempts);
        info!(
            "restarting {name} (attempt {} of {}, backoff {delay:?})",
            attempts + 1,
            self.config.max_restart_attempts
        );

        let task = tokio::spawn(restart_worker(worker, delay, self.config.restart_timeout()));
        self.pending_restarts.insert(
            name.to_string(),
            PendingRestart {
                task,
                requested_by: requested_by.map(str::to_string),
            },
        );
        self.sync_restart_state(name);
    }

    fn reset_restart_attempts(&mut self, name: &str) {
        if let Some(attempts) = self.restart_attempts.remove(name) {
            debug!("restart attempts of {name} reset (was {attempts})");
        }

        if let Some(pending) = self.pending_restarts.remove(name)
            && !pending.task.is_finished()
        {
            debug!("cancelling pending restart of {name}");
            pending.task.abort();
        }

        self.exhausted_alerted.remove(name);
        self.sync_restart_state(name);
    }

    /// A recovered dependency withdraws the restart its breaker asked for.
    /// The attempt counter only resets once the worker itself is running.
    fn cancel_restart_requested_by(&mut self, name: &str, dependency: &str) {
        let requested = self
            .pending_restarts
            .get(name)
            .is_some_and(|pending| pending.requested_by.as_deref() == Some(dependency));
        if !requested {
            return;
        }

        if let Some(pending) = self.pending_restarts.remove(name)
            && !pending.task.is_finished()
        {
            debug!("{dependency} recovered, cancelling pending restart of {name}");
            pending.task.abort();
        }
    }

    fn reset_breaker(&mut self, dependency: &str) -> bool {
        let Some(dep) = self
            .registry
            .dependencies
            .iter()
            .find(|dep| dep.name == dependency)
        else {
            return false;
        };

        dep.breaker.reset();
        if let Some(health) = self.health.get_mut(dependency) {
            health.circuit_phase = Some(CircuitPhase::Closed);
        }
        true
    }

    /// Mirror the restart counter into the worker's health record
    fn sync_restart_state(&mut self, name: &str) {
        let attempts = self.restart_attempts.get(name).copied().unwrap_or(0);
        let exhausted = self.exhausted_alerted.contains(name);

        if let Some(health) = self.health.get_mut(name) {
            health.restart_attempts = attempts;
            health.restarts_exhausted = exhausted;
        }
    }

    /// Persist and broadcast a record, alerting on transitions
    fn publish(&self, name: &str, previous: Option<ServiceHealth>) {
        let Some(current) = self.health.get(name) else {
            return;
        };

        let was_healthy = previous.as_ref().map(|p| p.healthy);
        let was_open = previous
            .as_ref()
            .is_some_and(|p| p.circuit_phase == Some(CircuitPhase::Open));

        if !current.healthy && was_healthy != Some(false) {
            self.reporter.alert(
                AlertSeverity::Warning,
                ALERT_SOURCE,
                format!("{} {name} is unhealthy", current.kind),
                current.error_message.clone().unwrap_or_default(),
            );
        } else if current.healthy && was_healthy == Some(false) {
            self.reporter.alert(
                AlertSeverity::Info,
                ALERT_SOURCE,
                format!("{} {name} recovered", current.kind),
                format!("{name} is healthy again"),
            );
        }

        if !was_open && current.circuit_phase == Some(CircuitPhase::Open) {
            self.reporter.alert(
                AlertSeverity::High,
                ALERT_SOURCE,
                format!("Circuit opened: {name}"),
                format!(
                    "{name} failed {} times in a row; calls are short-circuited",
                    current.consecutive_failures
                ),
            );
        }

        self.reporter.service_health(current);
    }

    fn report(&self) -> HealthReport {
        let services: Vec<ServiceReport> = self
            .health
            .values()
            .map(|health| ServiceReport {
                health: health.clone(),
                breaker: self
                    .registry
                    .dependencies
                    .iter()
                    .find(|dep| dep.name == health.service_name)
                    .map(|dep| dep.breaker.metrics()),
            })
            .collect();

        HealthReport {
            generated_at: Utc::now(),
            healthy: services.iter().all(|service| service.health.healthy),
            services,
        }
    }
}

/// Handle for interacting with the SupervisorActor
#[derive(Clone)]
pub struct SupervisorHandle {
    sender: mpsc::Sender<SupervisorCommand>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl SupervisorHandle {
    /// Spawn the supervisor; the first scheduled sweep runs one interval from now
    pub fn spawn(config: SupervisorConfig, registry: Registry, reporter: EventReporter) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (stop_tx, stop_rx) = watch::channel(false);

        let actor = SupervisorActor::new(config, registry, reporter, cmd_rx, stop_rx);
        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            stop_tx: Arc::new(stop_tx),
        }
    }

    /// Run one sweep immediately and return the resulting report
    pub async fn sweep_now(&self) -> Result<HealthReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorCommand::SweepNow { respond_to: tx })
            .await
            .context("supervisor stopped")?;

        rx.await.context("supervisor stopped")
    }

    pub async fn health_report(&self) -> Result<HealthReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorCommand::GetReport { respond_to: tx })
            .await
            .context("supervisor stopped")?;

        rx.await.context("supervisor stopped")
    }

    pub async fn reset_restart_attempts(&self, service_name: impl Into<String>) -> Result<()> {
        self.sender
            .send(SupervisorCommand::ResetRestartAttempts {
                service_name: service_name.into(),
            })
            .await
            .context("supervisor stopped")
    }

    /// Force a dependency's breaker closed; `false` if no such dependency
    pub async fn reset_breaker(&self, dependency: impl Into<String>) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SupervisorCommand::ResetBreaker {
                dependency: dependency.into(),
                respond_to: tx,
            })
            .await
            .context("supervisor stopped")?;

        rx.await.context("supervisor stopped")
    }

    /// Stop the supervisor; an in-flight sweep is abandoned
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}
