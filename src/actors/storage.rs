//! StorageActor - Persists monitoring records
//!
//! ## Architecture
//!
//! The actor owns the [`StorageBackend`] and drains a bounded mpsc queue of
//! [`StorageCommand`]s, writing one record at a time. Producers never wait on
//! the database: [`StorageHandle`] implements [`PersistenceSink`] with
//! `try_send`, so a full queue drops the record with a warning instead of
//! stalling the supervisor or the power controller.
//!
//! ## Retention
//!
//! With `retention_days` configured, power samples and alerts older than the
//! retention period are deleted on startup and then once a day. Power events
//! are an audit log and are never deleted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};

use super::messages::{
    Alert, PowerEventRecord, PowerSample, ServiceHealth, StorageCommand, StorageRecord,
    StorageStats,
};
use crate::sink::PersistenceSink;
use crate::storage::StorageBackend;

/// Capacity of the write queue
const QUEUE_CAPACITY: usize = 1024;

/// Cleanup interval - run retention cleanup daily
const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct StorageActor {
    backend: Arc<dyn StorageBackend>,

    command_rx: mpsc::Receiver<StorageCommand>,

    /// Retention period in days (None = keep everything)
    retention_days: Option<u32>,

    stats: StorageStats,
}

impl StorageActor {
    pub fn new(
        command_rx: mpsc::Receiver<StorageCommand>,
        backend: Arc<dyn StorageBackend>,
        retention_days: Option<u32>,
    ) -> Self {
        if let Some(days) = retention_days {
            debug!("retention cleanup enabled: {} days", days);
        }

        Self {
            backend,
            command_rx,
            retention_days,
            stats: StorageStats::default(),
        }
    }

    /// Run the actor's main loop
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        debug!("starting storage actor");

        let has_retention = self.retention_days.is_some();
        let mut cleanup_interval =
            time::interval_at(Instant::now() + CLEANUP_INTERVAL, CLEANUP_INTERVAL);
        cleanup_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        if has_retention {
            debug!("running initial retention cleanup on startup");
            self.run_cleanup().await;
        }

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(StorageCommand::Shutdown) => {
                            info!("storage actor shutting down");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            debug!("all storage handles dropped, shutting down");
                            break;
                        }
                    }
                }

                _ = cleanup_interval.tick(), if has_retention => {
                    debug!("daily retention cleanup triggered");
                    self.run_cleanup().await;
                }
            }
        }

        debug!("closing backend");
        if let Err(e) = self.backend.close().await {
            error!("error closing backend: {}", e);
        }

        debug!("storage actor stopped");
    }

    async fn handle_command(&mut self, cmd: StorageCommand) {
        match cmd {
            StorageCommand::Record(record) => self.write(record).await,
            StorageCommand::Flush { respond_to } => {
                // The queue is drained in order, so everything sent before
                // this command has already been written.
                trace!("flush barrier reached");
                let _ = respond_to.send(Ok(()));
            }
            StorageCommand::GetStats { respond_to } => {
                let _ = respond_to.send(self.stats.clone());
            }
            StorageCommand::Shutdown => {}
        }
    }

    async fn write(&mut self, record: StorageRecord) {
        let result = match &record {
            StorageRecord::ServiceHealth(health) => {
                self.backend.upsert_service_health(health).await
            }
            StorageRecord::PowerSample(sample) => self.backend.insert_power_sample(sample).await,
            StorageRecord::PowerEvent(event) => self.backend.insert_power_event(event).await,
            StorageRecord::Alert(alert) => self.backend.insert_alert(alert).await,
        };

        match result {
            Ok(()) => {
                self.stats.records_written += 1;
                trace!("stored {}", record.kind());
            }
            Err(e) => {
                // Dropped, not retried
                self.stats.write_failures += 1;
                error!("failed to store {}: {}", record.kind(), e);
            }
        }
    }

    /// Delete samples and alerts older than the retention period
    async fn run_cleanup(&mut self) {
        let Some(retention_days) = self.retention_days else {
            return;
        };

        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        debug!("running retention cleanup (deleting data before {})", cutoff);

        match self.backend.cleanup_old_records(cutoff).await {
            Ok(deleted) => {
                self.stats.records_deleted += deleted as u64;
                if deleted > 0 {
                    info!(
                        "retention cleanup complete: deleted {} old records (total: {})",
                        deleted, self.stats.records_deleted
                    );
                } else {
                    trace!("retention cleanup: nothing to delete");
                }
            }
            Err(e) => {
                // Retried on the next interval
                error!("failed to clean up old records: {}", e);
            }
        }
    }
}

impl StorageRecord {
    fn kind(&self) -> &'static str {
        match self {
            StorageRecord::ServiceHealth(_) => "service health",
            StorageRecord::PowerSample(_) => "power sample",
            StorageRecord::PowerEvent(_) => "power event",
            StorageRecord::Alert(_) => "alert",
        }
    }
}

/// Handle for interacting with the StorageActor
#[derive(Clone)]
pub struct StorageHandle {
    sender: mpsc::Sender<StorageCommand>,
}

impl StorageHandle {
    /// Spawn a new storage actor writing to `backend`
    pub fn spawn(backend: Arc<dyn StorageBackend>, retention_days: Option<u32>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_CAPACITY);

        let actor = StorageActor::new(cmd_rx, backend, retention_days);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Wait until every record queued so far has been written
    pub async fn flush(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(StorageCommand::Flush { respond_to: tx })
            .await?;

        rx.await??;
        Ok(())
    }

    /// Get storage statistics
    pub async fn stats(&self) -> Option<StorageStats> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(StorageCommand::GetStats { respond_to: tx })
            .await
            .ok()?;

        rx.await.ok()
    }

    /// Stop the actor after the records already queued are written
    pub async fn shutdown(&self) {
        if self.sender.send(StorageCommand::Shutdown).await.is_err() {
            debug!("storage actor already stopped");
        }
    }

    fn enqueue(&self, record: StorageRecord) {
        match self.sender.try_send(StorageCommand::Record(record)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(StorageCommand::Record(record))) => {
                warn!("storage queue full, dropping {}", record.kind());
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("storage queue full, dropping record");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("storage actor stopped, dropping record");
            }
        }
    }
}

impl PersistenceSink for StorageHandle {
    fn record_service_health(&self, snapshot: ServiceHealth) {
        self.enqueue(StorageRecord::ServiceHealth(snapshot));
    }

    fn record_power_sample(&self, sample: PowerSample) {
        self.enqueue(StorageRecord::PowerSample(sample));
    }

    fn record_power_event(&self, event: PowerEventRecord) {
        self.enqueue(StorageRecord::PowerEvent(event));
    }

    fn record_alert(&self, alert: Alert) {
        self.enqueue(StorageRecord::Alert(alert));
    }
}
