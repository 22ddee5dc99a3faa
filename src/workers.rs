//! Worker capabilities
//!
//! A worker is anything long-running the supervisor keeps alive: a container,
//! a systemd unit, an in-process task. The supervisor only needs liveness;
//! start and stop are optional capabilities a worker may offer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::config::{CommandSpec, WorkerConfig};
use crate::process;

#[async_trait]
pub trait LivenessCheckable: Send + Sync {
    async fn is_running(&self) -> bool;
}

#[async_trait]
pub trait Startable: Send + Sync {
    async fn start(&self) -> Result<()>;
}

#[async_trait]
pub trait Stoppable: Send + Sync {
    async fn stop(&self) -> Result<()>;
}

/// A named worker registered with the supervisor
#[derive(Clone)]
pub struct Worker {
    name: String,
    liveness: Arc<dyn LivenessCheckable>,
    starter: Option<Arc<dyn Startable>>,
    stopper: Option<Arc<dyn Stoppable>>,
}

impl Worker {
    pub fn new(name: impl Into<String>, liveness: Arc<dyn LivenessCheckable>) -> Self {
        Self {
            name: name.into(),
            liveness,
            starter: None,
            stopper: None,
        }
    }

    /// A component that offers every capability
    pub fn from_component<C>(name: impl Into<String>, component: Arc<C>) -> Self
    where
        C: LivenessCheckable + Startable + Stoppable + 'static,
    {
        Self::new(name, component.clone())
            .with_start(component.clone())
            .with_stop(component)
    }

    pub fn with_start(mut self, starter: Arc<dyn Startable>) -> Self {
        self.starter = Some(starter);
        self
    }

    pub fn with_stop(mut self, stopper: Arc<dyn Stoppable>) -> Self {
        self.stopper = Some(stopper);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn is_running(&self) -> bool {
        self.liveness.is_running().await
    }

    pub fn starter(&self) -> Option<&Arc<dyn Startable>> {
        self.starter.as_ref()
    }

    pub fn stopper(&self) -> Option<&Arc<dyn Stoppable>> {
        self.stopper.as_ref()
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("startable", &self.starter.is_some())
            .field("stoppable", &self.stopper.is_some())
            .finish()
    }
}

/// Running when the command exits with status 0
pub struct CommandLiveness {
    spec: CommandSpec,
    timeout: Duration,
}

impl CommandLiveness {
    pub fn new(spec: CommandSpec, timeout: Duration) -> Self {
        Self { spec, timeout }
    }
}

#[async_trait]
impl LivenessCheckable for CommandLiveness {
    async fn is_running(&self) -> bool {
        match process::run_with_timeout(&self.spec, self.timeout).await {
            Ok(_) => true,
            Err(e) => {
                debug!("liveness command failed: {e:#}");
                false
            }
        }
    }
}

/// A start or stop action implemented by a shell command
pub struct CommandAction {
    spec: CommandSpec,
}

impl CommandAction {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Startable for CommandAction {
    async fn start(&self) -> Result<()> {
        process::run(&self.spec).await.map(|_| ())
    }
}

#[async_trait]
impl Stoppable for CommandAction {
    async fn stop(&self) -> Result<()> {
        process::run(&self.spec).await.map(|_| ())
    }
}

/// Build a worker from its configuration
pub fn build_worker(config: &WorkerConfig, timeout: Duration) -> Worker {
    let mut worker = Worker::new(
        config.name.clone(),
        Arc::new(CommandLiveness::new(config.is_running.clone(), timeout)),
    );

    if let Some(start) = &config.start {
        worker = worker.with_start(Arc::new(CommandAction::new(start.clone())));
    }

    if let Some(stop) = &config.stop {
        worker = worker.with_stop(Arc::new(CommandAction::new(stop.clone())));
    }

    worker
}
