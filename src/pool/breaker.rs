//! Per-server circuit breaker.
//!
//! ```text
//!            failures >= threshold
//!   Closed ------------------------> Open
//!     ^                               |  cooldown elapsed
//!     |   trial succeeds              v
//!     +--------------------------- HalfOpen
//!                                     |  trial fails: reopen, cooldown doubled
//!                                     +--------------------------> Open
//! ```
//!
//! All transitions take `now` explicitly so the machine can be driven
//! deterministically.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

/// Outcome of asking the breaker for permission to send a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; normal request.
    Allowed,
    /// The single half-open trial request.
    Trial,
    Rejected,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Instant,
    cooldown: Duration,
    trial_in_flight: bool,
    last_transition: Instant,
    threshold: u32,
    base_cooldown: Duration,
    max_cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig, now: Instant) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: now,
            cooldown: config.cooldown(),
            trial_in_flight: false,
            last_transition: now,
            threshold: config.failure_threshold.max(1),
            base_cooldown: config.cooldown(),
            max_cooldown: config.max_cooldown().max(config.cooldown()),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_transition(&self) -> Instant {
        self.last_transition
    }

    /// Current cool-down, doubled after every failed trial.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// When an open circuit will admit its next trial.
    pub fn retry_at(&self) -> Option<Instant> {
        (self.state == BreakerState::Open).then(|| self.opened_at + self.cooldown)
    }

    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open if now >= self.opened_at + self.cooldown => {
                self.transition(BreakerState::HalfOpen, now);
                self.trial_in_flight = true;
                Admission::Trial
            }
            BreakerState::Open => Admission::Rejected,
            BreakerState::HalfOpen if !self.trial_in_flight => {
                self.trial_in_flight = true;
                Admission::Trial
            }
            BreakerState::HalfOpen => Admission::Rejected,
        }
    }

    /// Record a successful request admitted as `admission`.
    ///
    /// Only the trial's verdict moves a half-open circuit. Requests admitted
    /// before the circuit opened are ignored once it has left `Closed`.
    pub fn on_success(&mut self, admission: Admission, now: Instant) {
        match (self.state, admission) {
            (BreakerState::Closed, _) => self.consecutive_failures = 0,
            (BreakerState::HalfOpen, Admission::Trial) => {
                self.consecutive_failures = 0;
                self.trial_in_flight = false;
                self.cooldown = self.base_cooldown;
                self.transition(BreakerState::Closed, now);
            }
            _ => {}
        }
    }

    pub fn on_failure(&mut self, admission: Admission, now: Instant) {
        match (self.state, admission) {
            (BreakerState::Closed, _) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.threshold {
                    self.open(now);
                }
            }
            (BreakerState::HalfOpen, Admission::Trial) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.trial_in_flight = false;
                self.cooldown = self.cooldown.saturating_mul(2).min(self.max_cooldown);
                self.open(now);
            }
            _ => {}
        }
    }

    /// The trial ended without a verdict (cancelled); allow a new one.
    pub fn abandon(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.trial_in_flight = false;
        }
    }

    fn open(&mut self, now: Instant) {
        self.opened_at = now;
        self.transition(BreakerState::Open, now);
    }

    fn transition(&mut self, to: BreakerState, now: Instant) {
        self.state = to;
        self.last_transition = now;
    }
}
