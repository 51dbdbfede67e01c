//! Circuit breaker guarding calls to the credential authority.
//!
//! `Closed` calls normally.  Once the last `failure_threshold` consecutive
//! failures all fall within a sliding `error_window` it opens and the relay stops calling the
//! authority.  Once `cooldown` has elapsed a single caller is admitted as a
//! probe; its outcome either closes or re-opens the circuit.
//!
//! Breaker state is per relay instance.  Timeouts count as failures; an
//! authority *rejection* of a credential counts as a success.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::CircuitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0 = closed, 1 = half-open, 2 = open.
    pub fn as_gauge(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

/// What the breaker allows the caller to do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Call the authority normally (retry permitted).
    Call,
    /// The single half-open trial call.  Must be reported back.
    Probe,
    /// Do not call the authority.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct CircuitSettings {
    pub failure_threshold: u32,
    pub error_window: Duration,
    pub cooldown: Duration,
}

impl From<&CircuitConfig> for CircuitSettings {
    fn from(c: &CircuitConfig) -> Self {
        Self {
            failure_threshold: c.failure_threshold,
            error_window: Duration::from_secs(c.error_window_secs),
            cooldown: Duration::from_secs(c.cooldown_secs),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// Times of the most recent consecutive failures, oldest first, at
    /// most `failure_threshold` of them.
    recent_failures: VecDeque<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    last_success: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    settings: CircuitSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(settings: CircuitSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                recent_failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
                last_success: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Last time the authority answered (accept or reject) on this instance.
    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_success
    }

    pub fn admit(&self, now: DateTime<Utc>) -> Admission {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Admission::Call,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map(|at| elapsed(at, now) >= self.settings.cooldown)
                    .unwrap_or(true);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!("authority circuit half-open, probing");
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

    pub fn record_success(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!(from = ?inner.state, "authority circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.recent_failures.clear();
        inner.opened_at = None;
        inner.probe_in_flight = false;
        inner.last_success = Some(now);
    }

    pub fn record_failure(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                warn!("authority probe failed, circuit re-opened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.probe_in_flight = false;
            }
            CircuitState::Open => {
                // Late failure from a call admitted before the circuit opened.
            }
            CircuitState::Closed => {
                let threshold = self.settings.failure_threshold.max(1) as usize;
                inner.recent_failures.push_back(now);
                while inner.recent_failures.len() > threshold {
                    inner.recent_failures.pop_front();
                }
                let oldest = inner.recent_failures.front().copied().unwrap_or(now);
                if inner.recent_failures.len() == threshold
                    && elapsed(oldest, now) <= self.settings.error_window
                {
                    warn!(
                        failures = threshold,
                        since = %oldest,
                        "authority circuit opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.recent_failures.clear();
                }
            }
        }
    }
}

fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}
