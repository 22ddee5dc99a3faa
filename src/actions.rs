//! Destructive host actions used by the power controller
//!
//! Every action is best effort: a container that refuses to stop or a pool
//! that cannot be snapshotted is reported in the [`ActionReport`] and the
//! action carries on with the remaining items.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::CommandSpec;
use crate::process;

/// Per-item outcome of a best-effort action
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActionReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl ActionReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, item: &str, result: Result<String>) {
        match result {
            Ok(_) => self.succeeded.push(item.to_string()),
            Err(e) => {
                warn!("{item}: {e:#}");
                self.failed.push((item.to_string(), format!("{e:#}")));
            }
        }
    }
}

#[async_trait]
pub trait ShutdownActions: Send + Sync {
    async fn stop_all_containers(&self, timeout: Duration) -> Result<ActionReport>;

    async fn stop_containers(&self, names: &[String], timeout: Duration) -> Result<ActionReport>;

    /// Snapshot every pool whose health is ONLINE
    async fn snapshot_online_pools(&self, timeout: Duration) -> Result<ActionReport>;

    async fn flush_filesystems(&self, timeout: Duration) -> Result<()>;
}

/// Actions against the local host using the docker, zpool/zfs and sync CLIs
#[derive(Debug, Clone, Default)]
pub struct HostActions;

impl HostActions {
    /// Containers stop in parallel, so the whole step fits in one `timeout`
    async fn stop_each(&self, names: &[String], timeout: Duration) -> ActionReport {
        let grace = timeout.as_secs().to_string();
        let stops = names.iter().map(|name| {
            let spec = CommandSpec::new("docker", &["stop", "-t", &grace, name]);
            async move { (name, process::run_with_timeout(&spec, timeout).await) }
        });

        let mut report = ActionReport::default();
        for (name, result) in join_all(stops).await {
            report.record(name, result);
        }
        report
    }
}

#[async_trait]
impl ShutdownActions for HostActions {
    async fn stop_all_containers(&self, timeout: Duration) -> Result<ActionReport> {
        let list = CommandSpec::new("docker", &["ps", "--format", "{{.Names}}"]);
        let output = process::run_with_timeout(&list, timeout).await?;
        let running = parse_lines(&output);
        debug!("stopping {} running containers", running.len());

        Ok(self.stop_each(&running, timeout).await)
    }

    async fn stop_containers(&self, names: &[String], timeout: Duration) -> Result<ActionReport> {
        Ok(self.stop_each(names, timeout).await)
    }

    async fn snapshot_online_pools(&self, timeout: Duration) -> Result<ActionReport> {
        let list = CommandSpec::new("zpool", &["list", "-H", "-o", "name,health"]);
        let output = process::run_with_timeout(&list, timeout).await?;
        let pools = parse_online_pools(&output);

        let snapshot_name = emergency_snapshot_name();
        let snapshots = pools.iter().map(|pool| {
            let target = format!("{pool}@{snapshot_name}");
            let spec = CommandSpec::new("zfs", &["snapshot", "-r", &target]);
            async move { (pool, process::run_with_timeout(&spec, timeout).await) }
        });

        let mut report = ActionReport::default();
        for (pool, result) in join_all(snapshots).await {
            report.record(pool, result);
        }
        Ok(report)
    }

    async fn flush_filesystems(&self, timeout: Duration) -> Result<()> {
        process::run_with_timeout(&CommandSpec::new("sync", &[]), timeout)
            .await
            .map(|_| ())
    }
}

fn parse_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Names of pools reported ONLINE by `zpool list -H -o name,health`
pub fn parse_online_pools(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut columns = line.split_whitespace();
            let name = columns.next()?;
            let health = columns.next()?;
            (health == "ONLINE").then(|| name.to_string())
        })
        .collect()
}

fn emergency_snapshot_name() -> String {
    format!("homewatch-emergency-{}", Utc::now().format("%Y%m%d-%H%M%S"))
}
