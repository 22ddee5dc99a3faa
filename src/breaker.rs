//! Per-dependency circuit breaker
//!
//! ## State Machine
//!
//! ```text
//!            failures >= failure_threshold
//!            (and requests >= volume_threshold)
//!   Closed ─────────────────────────────────────▶ Open
//!     ▲                                          │  ▲
//!     │ successes >= success_threshold           │  │ any failure
//!     │                        open_timeout over │  │
//!     └──────────────────── HalfOpen ◀───────────┘  │
//!                              └────────────────────┘
//! ```
//!
//! While open, calls are rejected with [`CircuitOpenError`] without running the
//! wrapped operation. Rejections are counted separately and never touch the
//! request or failure counters.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BreakerConfig, ConfigError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitPhase::Closed => write!(f, "closed"),
            CircuitPhase::Open => write!(f, "open"),
            CircuitPhase::HalfOpen => write!(f, "half_open"),
        }
    }
}

impl std::str::FromStr for CircuitPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(CircuitPhase::Closed),
            "open" => Ok(CircuitPhase::Open),
            "half_open" => Ok(CircuitPhase::HalfOpen),
            other => Err(format!("unknown circuit phase '{other}'")),
        }
    }
}

/// Returned instead of running the operation while the breaker is open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitOpenError {
    pub name: String,
}

impl fmt::Display for CircuitOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "circuit breaker '{}' is open", self.name)
    }
}

impl std::error::Error for CircuitOpenError {}

/// Outcome of [`CircuitBreaker::execute`] when the call did not succeed
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The call was short-circuited; the operation did not run
    Open(CircuitOpenError),

    /// The operation ran and failed
    Failed(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open(_))
    }
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Open(err) => write!(f, "{err}"),
            BreakerError::Failed(err) => write!(f, "{err}"),
        }
    }
}

impl<E> std::error::Error for BreakerError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BreakerError::Open(err) => Some(err),
            BreakerError::Failed(err) => Some(err),
        }
    }
}

/// Read-only snapshot of a breaker's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub phase: CircuitPhase,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub phase: CircuitPhase,

    /// `false` only while the breaker is open
    pub healthy: bool,
}

#[derive(Debug)]
struct BreakerState {
    phase: CircuitPhase,
    consecutive_successes: u32,
    consecutive_failures: u32,
    total_requests: u64,
    total_failures: u64,
    total_rejections: u64,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,

    /// Monotonic instant used for the open timeout
    opened_at: Option<Instant>,

    /// Wall-clock time of the same moment, for reporting
    opened_at_wall: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            phase: CircuitPhase::Closed,
            consecutive_successes: 0,
            consecutive_failures: 0,
            total_requests: 0,
            total_failures: 0,
            total_rejections: 0,
            last_success_at: None,
            last_failure_at: None,
            opened_at: None,
            opened_at_wall: None,
        }
    }

    /// Streak counters only describe the current phase.
    fn enter(&mut self, phase: CircuitPhase) {
        self.phase = phase;
        self.consecutive_successes = 0;
        self.consecutive_failures = 0;
    }

    fn trip(&mut self) {
        self.enter(CircuitPhase::Open);
        self.opened_at = Some(Instant::now());
        self.opened_at_wall = Some(Utc::now());
    }
}

/// Failure-isolation state machine guarding one external dependency
///
/// The breaker is shared behind an `Arc`; state lives in a mutex that is never
/// held across the wrapped operation.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Result<Self, ConfigError> {
        let name = name.into();
        config.validate(&name)?;

        Ok(Self {
            name,
            config,
            state: Mutex::new(BreakerState::closed()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, BreakerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `operation` unless the breaker is open
    ///
    /// An open breaker whose timeout has elapsed moves to half-open and lets
    /// this call through.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit().map_err(BreakerError::Open)?;

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(BreakerError::Failed(err))
            }
        }
    }

    fn admit(&self) -> Result<(), CircuitOpenError> {
        let mut state = self.state();

        if state.phase != CircuitPhase::Open {
            return Ok(());
        }

        let timeout_elapsed = state
            .opened_at
            .is_some_and(|opened| opened.elapsed() >= self.config.open_timeout());

        if timeout_elapsed {
            info!(breaker = %self.name, "open timeout elapsed, moving to half-open");
            state.enter(CircuitPhase::HalfOpen);
            return Ok(());
        }

        state.total_rejections += 1;
        debug!(breaker = %self.name, "rejecting call while open");
        Err(CircuitOpenError {
            name: self.name.clone(),
        })
    }

    fn on_success(&self) {
        let mut state = self.state();
        state.total_requests += 1;
        state.last_success_at = Some(Utc::now());

        if state.phase == CircuitPhase::HalfOpen {
            state.consecutive_successes += 1;

            if state.consecutive_successes >= self.config.success_threshold {
                info!(breaker = %self.name, "probation passed, closing");
                let last_success_at = state.last_success_at;
                let last_failure_at = state.last_failure_at;
                *state = BreakerState::closed();
                state.last_success_at = last_success_at;
                state.last_failure_at = last_failure_at;
            }
        }
    }

    fn on_failure(&self) {
        let mut state = self.state();
        state.total_requests += 1;
        state.total_failures += 1;
        state.last_failure_at = Some(Utc::now());

        match state.phase {
            CircuitPhase::Closed => {
                state.consecutive_failures += 1;

                if state.total_requests >= self.config.volume_threshold
                    && state.consecutive_failures >= self.config.failure_threshold
                {
                    warn!(
                        breaker = %self.name,
                        failures = state.consecutive_failures,
                        "failure threshold reached, opening"
                    );
                    state.trip();
                }
            }
            CircuitPhase::HalfOpen => {
                warn!(breaker = %self.name, "failure during probation, reopening");
                state.trip();
            }
            // A call admitted before another caller tripped the breaker.
            CircuitPhase::Open => {}
        }
    }

    /// Administrative override: force closed and forget all history
    pub fn reset(&self) {
        info!(breaker = %self.name, "manual reset");
        *self.state() = BreakerState::closed();
    }

    pub fn phase(&self) -> CircuitPhase {
        self.state().phase
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let state = self.state();
        BreakerMetrics {
            name: self.name.clone(),
            phase: state.phase,
            consecutive_successes: state.consecutive_successes,
            consecutive_failures: state.consecutive_failures,
            total_requests: state.total_requests,
            total_failures: state.total_failures,
            total_rejections: state.total_rejections,
            last_success_at: state.last_success_at,
            last_failure_at: state.last_failure_at,
            opened_at: state.opened_at_wall,
        }
    }

    pub fn status(&self) -> BreakerStatus {
        let phase = self.phase();
        BreakerStatus {
            name: self.name.clone(),
            phase,
            healthy: phase != CircuitPhase::Open,
        }
    }
}
