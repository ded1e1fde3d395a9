//! Circuit breaker for remote sources.
//!
//! After `failure_threshold` consecutive failures the breaker opens for a
//! jittered, exponentially growing window (`base_backoff * 2^(n-1)`, capped at
//! `max_backoff`). While open, [`try_acquire`](CircuitBreaker::try_acquire)
//! refuses every caller so they fall back to cached data. Once the window
//! elapses exactly one caller gets a trial permit (half-open); its outcome
//! closes the breaker or reopens it with a longer window.

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Fraction of the window randomly shaved off, in `[0, 1)`.
    pub jitter: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    pub next_trial_at: Option<Instant>,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    /// Number of times the breaker has opened since it was last closed.
    trips: u32,
    opened_at: Option<Instant>,
    next_trial_at: Option<Instant>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                trips: 0,
                opened_at: None,
                next_trial_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitBreakerState {
        let inner = self.inner.lock();
        CircuitBreakerState {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
            next_trial_at: inner.next_trial_at,
        }
    }

    /// Time until the next trial is allowed, or zero when requests may flow.
    pub fn retry_in(&self) -> Duration {
        let inner = self.inner.lock();
        match (inner.state, inner.next_trial_at) {
            (CircuitState::Closed, _) | (_, None) => Duration::ZERO,
            (_, Some(at)) => at.saturating_duration_since(self.clock.now()),
        }
    }

    /// Ask to make a request. `None` means: serve cached data, do not call out.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Some(Permit {
                breaker: self,
                trial: false,
                settled: false,
            }),
            CircuitState::Open => {
                let due = inner.next_trial_at.map_or(true, |at| now >= at);
                if !due {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                tracing::info!(breaker = %self.name, "circuit half-open, sending trial");
                Some(Permit {
                    breaker: self,
                    trial: true,
                    settled: false,
                })
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                Some(Permit {
                    breaker: self,
                    trial: true,
                    settled: false,
                })
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!(breaker = %self.name, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.trips = 0;
        inner.opened_at = None;
        inner.next_trial_at = None;
        inner.trial_in_flight = false;
    }

    fn on_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.trial_in_flight = false;

        let should_open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if !should_open {
            return;
        }

        inner.trips = inner.trips.saturating_add(1);
        let window = self.backoff_window(inner.trips);
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.next_trial_at = Some(now + window);
        tracing::warn!(
            breaker = %self.name,
            failures = inner.consecutive_failures,
            window_ms = window.as_millis() as u64,
            "circuit opened"
        );
    }

    /// A trial that never reported back frees the slot for the next caller.
    fn on_abandoned_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    fn backoff_window(&self, trips: u32) -> Duration {
        let exp = trips.saturating_sub(1).min(16);
        let full = self
            .config
            .base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.config.max_backoff);
        if self.config.jitter <= 0.0 {
            return full;
        }
        let shave = rand::thread_rng().gen_range(0.0..self.config.jitter.min(0.99));
        full.mul_f64(1.0 - shave)
    }
}

/// Permission to call the protected dependency. Report the outcome with
/// [`success`](Permit::success) or [`failure`](Permit::failure).
#[must_use]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure();
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.on_abandoned_trial();
        }
    }
}
