//! Circuit breaker over LLM provider destinations.
//!
//! CLOSED counts consecutive failures; at the threshold it trips to OPEN and
//! rejects immediately for the cool-down. After the cool-down, HALF_OPEN
//! admits exactly one probe: success closes the circuit and resets the
//! counters, failure re-opens it for another cool-down.

use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
#[error("circuit open for destination")]
pub struct CircuitOpen;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    // Guarded state only; no I/O ever happens under this lock.
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Asks permission to make one call. `Err(CircuitOpen)` means reject
    /// without touching the upstream.
    pub fn try_acquire(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            State::Closed => Ok(()),
            State::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown {
                    inner.state = State::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(CircuitOpen)
                }
            }
            State::HalfOpen => {
                if inner.probe_in_flight {
                    Err(CircuitOpen)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            State::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = State::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            State::HalfOpen | State::Open => {
                // Failed probe (or a straggler): back to OPEN for a full cool-down.
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
            }
        }
    }

    pub fn state_label(&self) -> &'static str {
        match self.inner.lock().expect("breaker lock").state {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half_open",
        }
    }
}

/// One breaker per provider destination, created on first use.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl BreakerRegistry {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            failure_threshold,
            cooldown,
        }
    }

    pub fn get(&self, destination: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(destination.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(self.failure_threshold, self.cooldown))
            })
            .clone()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }
}
