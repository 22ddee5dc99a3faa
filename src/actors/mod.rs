//! Actor-based monitoring core
//!
//! Each actor runs as an independent async task communicating via Tokio
//! channels.
//!
//! ## Architecture Overview
//!
//! ```text
//!                      ┌─────────────────┐
//!                      │   Hub (main)    │
//!                      └────────┬────────┘
//!                               │ spawns
//!               ┌───────────────┼────────────────┐
//!               │               │                │
//!      ┌────────▼────────┐      │      ┌─────────▼─────────┐
//!      │ SupervisorActor │      │      │    PowerActor     │
//!      │ (breakers,      │      │      │ (UPS telemetry,   │
//!      │  restarts)      │      │      │  shutdown tiers)  │
//!      └────────┬────────┘      │      └─────────┬─────────┘
//!               │         EventReporter          │
//!               └───────────────┼────────────────┘
//!                     ┌─────────┴──────────┐
//!                     │                    │
//!            ┌────────▼───────┐   ┌────────▼─────────┐
//!            │  StorageActor  │   │ Broadcast bus    │
//!            │  (mpsc queue)  │   │ (MonitorEvent)   │
//!            └────────────────┘   └──────────────────┘
//! ```
//!
//! ## Actor Types
//!
//! - **SupervisorActor**: probes dependencies through circuit breakers and
//!   restarts workers with bounded exponential backoff
//! - **PowerActor**: polls the UPS and drives the escalating shutdown sequence
//! - **StorageActor**: persists records written through the
//!   [`PersistenceSink`](crate::sink::PersistenceSink)
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Events**: [`MonitorEvent`](messages::MonitorEvent)s fan out on a broadcast channel
//! 3. **Request/Response**: oneshot channels for synchronous queries
//! 4. **Stop**: a `watch` flag set synchronously by `stop()`; in-flight work is
//!    abandoned

use tokio::sync::watch;

pub mod messages;
pub mod power;
pub mod storage;
pub mod supervisor;

/// Resolves once the stop flag is set or every sender is gone
pub(crate) async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        let stopped = *stop_rx.borrow_and_update();
        if stopped {
            return;
        }
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}
