//! Storage backend trait definition

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use crate::actors::messages::{Alert, PowerEventRecord, PowerSample, ServiceHealth};

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Trait for persistent storage backends
///
/// Four kinds of records are stored:
///
/// - **service health**: one row per service, updated in place
/// - **power samples**: time series, subject to retention
/// - **power events**: append-only audit log, never cleaned up
/// - **alerts**: append-only, subject to retention
///
/// Implementations must be `Send + Sync`; the storage actor and the database
/// liveness probe share one backend.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Insert or replace the health record of a service
    async fn upsert_service_health(&self, health: &ServiceHealth) -> StorageResult<()>;

    async fn insert_power_sample(&self, sample: &PowerSample) -> StorageResult<()>;

    async fn insert_power_event(&self, event: &PowerEventRecord) -> StorageResult<()>;

    async fn insert_alert(&self, alert: &Alert) -> StorageResult<()>;

    /// All service health records, ordered by service name
    async fn query_service_health(&self) -> StorageResult<Vec<ServiceHealth>>;

    /// The N most recent power samples, oldest first
    async fn query_latest_power_samples(&self, limit: usize) -> StorageResult<Vec<PowerSample>>;

    /// Power events at or after `since`, oldest first
    async fn query_power_events(&self, since: DateTime<Utc>) -> StorageResult<Vec<PowerEventRecord>>;

    /// Alerts at or after `since`, oldest first
    async fn query_alerts(&self, since: DateTime<Utc>) -> StorageResult<Vec<Alert>>;

    /// Delete power samples and alerts older than `before`
    ///
    /// Power events are kept for auditing. Returns the number of rows deleted.
    async fn cleanup_old_records(&self, before: DateTime<Utc>) -> StorageResult<usize>;

    /// Lightweight liveness check (e.g. `SELECT 1`)
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Human-readable stats about the backend
    async fn get_stats(&self) -> StorageResult<String>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
