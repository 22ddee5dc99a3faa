//! In-memory storage backend (no persistence)
//!
//! Keeps recent records in ring buffers. Used when no database is configured
//! and throughout the tests.
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Limited capacity**: each buffer holds at most [`MAX_RECORDS`] entries

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{HealthStatus, StorageBackend};
use super::error::StorageResult;
use crate::actors::messages::{Alert, PowerEventRecord, PowerSample, ServiceHealth};

/// Maximum records kept per buffer; the oldest entry is evicted first
pub const MAX_RECORDS: usize = 1000;

#[derive(Default)]
struct Records {
    services: BTreeMap<String, ServiceHealth>,
    samples: VecDeque<PowerSample>,
    events: VecDeque<PowerEventRecord>,
    alerts: VecDeque<Alert>,
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, item: T) {
    if buffer.len() == MAX_RECORDS {
        buffer.pop_front();
    }
    buffer.push_back(item);
}

#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<Records>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn upsert_service_health(&self, health: &ServiceHealth) -> StorageResult<()> {
        let mut records = self.records.write().await;
        records
            .services
            .insert(health.service_name.clone(), health.clone());
        Ok(())
    }

    async fn insert_power_sample(&self, sample: &PowerSample) -> StorageResult<()> {
        push_bounded(&mut self.records.write().await.samples, sample.clone());
        Ok(())
    }

    async fn insert_power_event(&self, event: &PowerEventRecord) -> StorageResult<()> {
        push_bounded(&mut self.records.write().await.events, event.clone());
        Ok(())
    }

    async fn insert_alert(&self, alert: &Alert) -> StorageResult<()> {
        push_bounded(&mut self.records.write().await.alerts, alert.clone());
        Ok(())
    }

    async fn query_service_health(&self) -> StorageResult<Vec<ServiceHealth>> {
        Ok(self.records.read().await.services.values().cloned().collect())
    }

    async fn query_latest_power_samples(&self, limit: usize) -> StorageResult<Vec<PowerSample>> {
        let records = self.records.read().await;
        let skip = records.samples.len().saturating_sub(limit);
        Ok(records.samples.iter().skip(skip).cloned().collect())
    }

    async fn query_power_events(&self, since: DateTime<Utc>) -> StorageResult<Vec<PowerEventRecord>> {
        let records = self.records.read().await;
        Ok(records
            .events
            .iter()
            .filter(|event| event.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn query_alerts(&self, since: DateTime<Utc>) -> StorageResult<Vec<Alert>> {
        let records = self.records.read().await;
        Ok(records
            .alerts
            .iter()
            .filter(|alert| alert.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn cleanup_old_records(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let mut records = self.records.write().await;
        let initial = records.samples.len() + records.alerts.len();

        records.samples.retain(|sample| sample.timestamp >= before);
        records.alerts.retain(|alert| alert.timestamp >= before);

        let deleted = initial - (records.samples.len() + records.alerts.len());
        debug!("in-memory cleanup removed {deleted} records older than {before}");
        Ok(deleted)
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let records = self.records.read().await;
        Ok(HealthStatus {
            healthy: true,
            message: "In-memory storage operational".to_string(),
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("services".to_string(), records.services.len().to_string()),
            ]),
        })
    }

    async fn get_stats(&self) -> StorageResult<String> {
        let records = self.records.read().await;
        Ok(format!(
            "In-Memory: {} services, {} power samples, {} power events, {} alerts",
            records.services.len(),
            records.samples.len(),
            records.events.len(),
            records.alerts.len()
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend (no-op)");
        Ok(())
    }
}
