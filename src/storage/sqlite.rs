//! SQLite storage backend implementation
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Readers are not blocked by the storage actor's writes
//! - **Connection pooling**: The liveness probe and the actor share one pool
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! Timestamps are stored as Unix milliseconds. Status flags and power event
//! details are stored as JSON text.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use crate::actors::messages::{
    Alert, AlertSeverity, PowerEventRecord, PowerEventType, PowerSample, ServiceHealth,
    ServiceKind,
};
use crate::breaker::CircuitPhase;

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the database file and run migrations
    ///
    /// ```no_run
    /// # use homewatch::storage::sqlite::SqliteBackend;
    /// # async fn example() -> anyhow::Result<()> {
    /// let backend = SqliteBackend::new("./homewatch.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> StorageResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| StorageError::CorruptRecord(format!("timestamp {millis} out of range")))
    }

    fn optional_timestamp(millis: Option<i64>) -> StorageResult<Option<DateTime<Utc>>> {
        millis.map(Self::millis_to_timestamp).transpose()
    }
}

fn parse_column<T>(value: &str) -> StorageResult<T>
where
    T: FromStr<Err = String>,
{
    value.parse().map_err(StorageError::CorruptRecord)
}

fn service_health_from_row(row: &SqliteRow) -> StorageResult<ServiceHealth> {
    let kind: String = row.try_get("kind")?;
    let circuit_phase: Option<String> = row.try_get("circuit_phase")?;

    Ok(ServiceHealth {
        service_name: row.try_get("service_name")?,
        kind: parse_column::<ServiceKind>(&kind)?,
        healthy: row.try_get("healthy")?,
        consecutive_failures: row.try_get::<i64, _>("consecutive_failures")? as u32,
        last_check_at: SqliteBackend::millis_to_timestamp(row.try_get("last_check_at")?)?,
        last_success_at: SqliteBackend::optional_timestamp(row.try_get("last_success_at")?)?,
        last_failure_at: SqliteBackend::optional_timestamp(row.try_get("last_failure_at")?)?,
        error_message: row.try_get("error_message")?,
        circuit_phase: circuit_phase
            .as_deref()
            .map(parse_column::<CircuitPhase>)
            .transpose()?,
        restart_attempts: row.try_get::<i64, _>("restart_attempts")? as u32,
        restarts_exhausted: row.try_get("restarts_exhausted")?,
    })
}

fn power_sample_from_row(row: &SqliteRow) -> StorageResult<PowerSample> {
    let flags: String = row.try_get("status_flags")?;

    Ok(PowerSample {
        timestamp: SqliteBackend::millis_to_timestamp(row.try_get("timestamp")?)?,
        ups_name: row.try_get("ups_name")?,
        on_battery: row.try_get("on_battery")?,
        battery_charge_percent: row.try_get::<f64, _>("battery_charge_percent")? as f32,
        battery_runtime_secs: row.try_get::<i64, _>("battery_runtime_secs")? as u64,
        load_percent: row.try_get::<Option<f64>, _>("load_percent")?.map(|v| v as f32),
        input_voltage: row.try_get::<Option<f64>, _>("input_voltage")?.map(|v| v as f32),
        status_flags: serde_json::from_str(&flags)?,
    })
}

fn power_event_from_row(row: &SqliteRow) -> StorageResult<PowerEventRecord> {
    let event_type: String = row.try_get("event_type")?;
    let details: String = row.try_get("details")?;

    Ok(PowerEventRecord {
        timestamp: SqliteBackend::millis_to_timestamp(row.try_get("timestamp")?)?,
        event_type: parse_column::<PowerEventType>(&event_type)?,
        battery_percent: row.try_get::<f64, _>("battery_percent")? as f32,
        runtime_remaining: row.try_get::<i64, _>("runtime_remaining")? as u64,
        details: serde_json::from_str(&details)?,
    })
}

fn alert_from_row(row: &SqliteRow) -> StorageResult<Alert> {
    let severity: String = row.try_get("severity")?;

    Ok(Alert {
        timestamp: SqliteBackend::millis_to_timestamp(row.try_get("timestamp")?)?,
        severity: parse_column::<AlertSeverity>(&severity)?,
        source: row.try_get("source")?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
    })
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self, health), fields(service = %health.service_name))]
    async fn upsert_service_health(&self, health: &ServiceHealth) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO service_health (
                service_name, kind, healthy, consecutive_failures, last_check_at,
                last_success_at, last_failure_at, error_message, circuit_phase,
                restart_attempts, restarts_exhausted
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (service_name) DO UPDATE SET
                kind = excluded.kind,
                healthy = excluded.healthy,
                consecutive_failures = excluded.consecutive_failures,
                last_check_at = excluded.last_check_at,
                last_success_at = excluded.last_success_at,
                last_failure_at = excluded.last_failure_at,
                error_message = excluded.error_message,
                circuit_phase = excluded.circuit_phase,
                restart_attempts = excluded.restart_attempts,
                restarts_exhausted = excluded.restarts_exhausted
            "#,
        )
        .bind(&health.service_name)
        .bind(health.kind.to_string())
        .bind(health.healthy)
        .bind(health.consecutive_failures as i64)
        .bind(Self::timestamp_to_millis(&health.last_check_at))
        .bind(health.last_success_at.as_ref().map(Self::timestamp_to_millis))
        .bind(health.last_failure_at.as_ref().map(Self::timestamp_to_millis))
        .bind(&health.error_message)
        .bind(health.circuit_phase.map(|phase| phase.to_string()))
        .bind(health.restart_attempts as i64)
        .bind(health.restarts_exhausted)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip_all)]
    async fn insert_power_sample(&self, sample: &PowerSample) -> StorageResult<()> {
        let flags = serde_json::to_string(&sample.status_flags)?;

        sqlx::query(
            r#"
            INSERT INTO power_samples (
                timestamp, ups_name, on_battery, battery_charge_percent,
                battery_runtime_secs, load_percent, input_voltage, status_flags
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Self::timestamp_to_millis(&sample.timestamp))
        .bind(&sample.ups_name)
        .bind(sample.on_battery)
        .bind(sample.battery_charge_percent as f64)
        .bind(sample.battery_runtime_secs as i64)
        .bind(sample.load_percent.map(f64::from))
        .bind(sample.input_voltage.map(f64::from))
        .bind(flags)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, event), fields(event_type = %event.event_type))]
    async fn insert_power_event(&self, event: &PowerEventRecord) -> StorageResult<()> {
        let details = serde_json::to_string(&event.details)?;

        sqlx::query(
            r#"
            INSERT INTO power_events (
                timestamp, event_type, battery_percent, runtime_remaining, details
            )
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(Self::timestamp_to_millis(&event.timestamp))
        .bind(event.event_type.to_string())
        .bind(event.battery_percent as f64)
        .bind(event.runtime_remaining as i64)
        .bind(details)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, alert), fields(severity = %alert.severity))]
    async fn insert_alert(&self, alert: &Alert) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO alerts (timestamp, severity, source, title, message)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(Self::timestamp_to_millis(&alert.timestamp))
        .bind(alert.severity.to_string())
        .bind(&alert.source)
        .bind(&alert.title)
        .bind(&alert.message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn query_service_health(&self) -> StorageResult<Vec<ServiceHealth>> {
        let rows = sqlx::query("SELECT * FROM service_health ORDER BY service_name ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(service_health_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn query_latest_power_samples(&self, limit: usize) -> StorageResult<Vec<PowerSample>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT * FROM power_samples
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut samples = rows
            .iter()
            .map(power_sample_from_row)
            .collect::<StorageResult<Vec<_>>>()?;
        // Oldest first
        samples.reverse();
        debug!("query returned {} power samples", samples.len());
        Ok(samples)
    }

    #[instrument(skip(self))]
    async fn query_power_events(&self, since: DateTime<Utc>) -> StorageResult<Vec<PowerEventRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM power_events WHERE timestamp >= ? ORDER BY timestamp ASC, id ASC",
        )
        .bind(Self::timestamp_to_millis(&since))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(power_event_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn query_alerts(&self, since: DateTime<Utc>) -> StorageResult<Vec<Alert>> {
        let rows =
            sqlx::query("SELECT * FROM alerts WHERE timestamp >= ? ORDER BY timestamp ASC, id ASC")
                .bind(Self::timestamp_to_millis(&since))
                .fetch_all(&self.pool)
                .await?;

        rows.iter().map(alert_from_row).collect()
    }

    #[instrument(skip(self), fields(before = %before))]
    async fn cleanup_old_records(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let before_millis = Self::timestamp_to_millis(&before);

        info!("cleaning up power samples and alerts older than {}", before);

        let mut tx = self.pool.begin().await?;

        let samples = sqlx::query("DELETE FROM power_samples WHERE timestamp < ?")
            .bind(before_millis)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let alerts = sqlx::query("DELETE FROM alerts WHERE timestamp < ?")
            .bind(before_millis)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        let deleted = (samples + alerts) as usize;
        info!("deleted {samples} power samples and {alerts} alerts");
        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let mut metadata = HashMap::new();
                metadata.insert("backend".to_string(), "sqlite".to_string());
                metadata.insert("db_path".to_string(), self.db_path.clone());

                Ok(HealthStatus {
                    healthy: true,
                    message: "SQLite backend operational".to_string(),
                    metadata,
                })
            }
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_stats(&self) -> StorageResult<String> {
        let (services, samples, events, alerts): (i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM service_health),
                (SELECT COUNT(*) FROM power_samples),
                (SELECT COUNT(*) FROM power_events),
                (SELECT COUNT(*) FROM alerts)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let file_size = std::fs::metadata(&self.db_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let file_size_mb = file_size as f64 / 1_000_000.0;

        Ok(format!(
            "SQLite: {services} services, {samples} power samples, {events} power events, \
             {alerts} alerts, {file_size_mb:.2} MB on disk"
        ))
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
