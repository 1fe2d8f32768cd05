use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{info, warn};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Outcome of asking the breaker whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed, call normally.
    Allowed,
    /// Circuit recovering: this caller holds the single probe slot and must
    /// report the outcome via `record_success`/`record_failure`.
    Probe,
    /// Circuit open, fail fast without a network attempt.
    Rejected,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Failure-isolation state machine guarding one upstream target.
///
/// Shared across all concurrent requests; every update happens under one
/// short-lived mutex, so callers racing for the half-open probe slot either
/// claim it or are rejected immediately, they never wait on the probe itself.
/// State lives only in-process and resets to `Closed` on restart.
pub struct CircuitBreaker {
    name: String,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            cooldown,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Decides whether a call may go out right now.
    ///
    /// After the cooldown has elapsed the first caller through here claims the
    /// probe slot; everyone else keeps getting `Rejected` until the probe
    /// outcome is recorded.
    pub fn admit(&self) -> Admission {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_some_and(|opened| opened.elapsed() >= self.cooldown);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!("Circuit breaker '{}' OPEN -> HALF_OPEN, probing", self.name);
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Admission::Rejected
                } else {
                    inner.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                info!("Circuit breaker '{}' HALF_OPEN -> CLOSED", self.name);
            }
            // A success reported while open is a stale outcome; ignore it.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, threshold: u32) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= threshold.max(1) {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        "Circuit breaker '{}' CLOSED -> OPEN after {} consecutive failures",
                        self.name, inner.consecutive_failures
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                warn!("Circuit breaker '{}' HALF_OPEN -> OPEN, probe failed", self.name);
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
