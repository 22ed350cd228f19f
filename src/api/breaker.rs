//! Circuit breaker for control-plane calls
//!
//! Fails fast when the control plane is unhealthy instead of burning a
//! timeout per message. Small finite state machine, state under a mutex.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Circuit breaker state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests flow through
    Closed,
    /// Requests fail fast
    Open,
    /// One probe in flight to test recovery
    HalfOpen,
}

impl BreakerState {
    /// Label used in logs and the health surface
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

/// Read-only view of the breaker for the health surface
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BreakerSnapshot {
    #[serde(serialize_with = "serialize_state")]
    pub state: BreakerState,
    pub failure_count: u32,
}

fn serialize_state<S: serde::Serializer>(
    state: &BreakerState,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(state.as_str())
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
}

/// Failure-budget state machine in front of the control-plane client
pub struct CircuitBreaker {
    max_failures: u32,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        Self {
            max_failures,
            reset_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure_at: None,
            }),
        }
    }

    /// Decide whether a call may proceed, applying time-based transitions.
    ///
    /// While open, returns `false` until `reset_timeout` has elapsed since the
    /// last failure; the first call after that transitions to half-open and is
    /// admitted as the probe. Further calls are rejected until the probe
    /// resolves via [`on_success`](Self::on_success) or
    /// [`on_failure`](Self::on_failure).
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();

        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .last_failure_at
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    tracing::info!("circuit breaker transitioning to half-open");
                    true
                } else {
                    false
                }
            }
            // The probe is already in flight
            BreakerState::HalfOpen => false,
        }
    }

    /// Record a successful call: zero the failure budget and close.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        if inner.state != BreakerState::Closed {
            tracing::info!("circuit breaker closed, control plane recovered");
        }
        inner.state = BreakerState::Closed;
    }

    /// Record a failed call.
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure_at = Some(Instant::now());

        match inner.state {
            BreakerState::Closed => {
                if inner.failure_count >= self.max_failures {
                    inner.state = BreakerState::Open;
                    tracing::warn!(
                        failures = inner.failure_count,
                        "circuit breaker opened, too many control-plane failures"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                tracing::warn!("circuit breaker re-opened, probe failed");
            }
            BreakerState::Open => {}
        }
    }

    /// Current state and failure count, for monitoring.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
        }
    }
}
