//! Persistence sink used by the monitoring core
//!
//! Writes are fire-and-forget from the caller's perspective: implementations
//! queue the record and log failures instead of returning them.

use crate::actors::messages::{Alert, PowerEventRecord, PowerSample, ServiceHealth};

pub trait PersistenceSink: Send + Sync {
    fn record_service_health(&self, snapshot: ServiceHealth);

    fn record_power_sample(&self, sample: PowerSample);

    fn record_power_event(&self, event: PowerEventRecord);

    fn record_alert(&self, alert: Alert);
}
