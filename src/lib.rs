//! Home-infrastructure monitoring agent
//!
//! The core is a resilience layer of three actors sharing one alerting path:
//!
//! - a per-dependency [`CircuitBreaker`](breaker::CircuitBreaker)
//! - the [`SupervisorActor`](actors::supervisor::SupervisorActor), which probes
//!   dependencies and restarts failed workers with bounded exponential backoff
//! - the [`PowerActor`](actors::power::PowerActor), which drives an escalating,
//!   idempotent shutdown sequence while the UPS is on battery

pub mod actions;
pub mod actors;
pub mod alerts;
pub mod breaker;
pub mod config;
pub mod probes;
pub mod process;
pub mod sink;
pub mod storage;
pub mod ups;
pub mod util;
pub mod workers;
