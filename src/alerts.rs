use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{error, info, trace, warn};

use crate::actors::messages::{
    Alert, AlertSeverity, MonitorEvent, PowerEventRecord, PowerSample, ServiceHealth,
};
use crate::sink::PersistenceSink;

/// Hands records to the persistence sink and publishes them on the event bus
///
/// Shared by the supervisor and the power controller so that every alert and
/// record takes the same path.
#[derive(Clone)]
pub struct EventReporter {
    sink: Arc<dyn PersistenceSink>,
    events: broadcast::Sender<MonitorEvent>,
}

impl EventReporter {
    pub fn new(sink: Arc<dyn PersistenceSink>, events: broadcast::Sender<MonitorEvent>) -> Self {
        Self { sink, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn alert(
        &self,
        severity: AlertSeverity,
        source: &str,
        title: impl Into<String>,
        message: impl Into<String>,
    ) {
        let alert = Alert {
            timestamp: Utc::now(),
            severity,
            source: source.to_string(),
            title: title.into(),
            message: message.into(),
        };

        match severity {
            AlertSeverity::Info => info!("[{source}] {}: {}", alert.title, alert.message),
            AlertSeverity::Warning => warn!("[{source}] {}: {}", alert.title, alert.message),
            AlertSeverity::High | AlertSeverity::Critical => {
                error!("[{source}] {}: {}", alert.title, alert.message)
            }
        }

        self.sink.record_alert(alert.clone());
        self.publish(MonitorEvent::Alert(alert));
    }

    pub fn service_health(&self, health: &ServiceHealth) {
        self.sink.record_service_health(health.clone());
        self.publish(MonitorEvent::ServiceHealth(health.clone()));
    }

    pub fn power_sample(&self, sample: PowerSample) {
        self.sink.record_power_sample(sample.clone());
        self.publish(MonitorEvent::PowerSample(sample));
    }

    pub fn power_event(&self, event: PowerEventRecord) {
        info!(
            "power event {} (battery {:.0}%, runtime {}s)",
            event.event_type, event.battery_percent, event.runtime_remaining
        );
        self.sink.record_power_event(event.clone());
        self.publish(MonitorEvent::PowerEvent(event));
    }

    // It's OK if there are no subscribers; the sink already has the record.
    fn publish(&self, event: MonitorEvent) {
        let topic = event.topic();
        match self.events.send(event) {
            Ok(num_receivers) => {
                trace!("published {topic} event to {num_receivers} receivers");
            }
            Err(_) => {
                trace!("no receivers for {topic} event (this is OK)");
            }
        }
    }
}
