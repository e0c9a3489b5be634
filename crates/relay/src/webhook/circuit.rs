// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-endpoint circuit breaker.
//!
//! Closed → Open when the rolling error rate over the sample window crosses
//! the threshold with enough samples. Open → HalfOpen when the cool-down
//! expires; HalfOpen admits exactly one probe. A successful probe closes the
//! circuit and resets the cool-down; a failed probe re-opens it with the
//! cool-down doubled, up to the cap.

use serde::Serialize;

use crate::window::SlidingWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitConfig {
    pub window_ms: u64,
    pub min_samples: u64,
    /// Open when the failure percentage strictly exceeds this.
    pub error_rate_pct: u8,
    pub cooldown_ms: u64,
    pub max_cooldown_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window_ms: 30_000,
            min_samples: 10,
            error_rate_pct: 50,
            cooldown_ms: 60_000,
            max_cooldown_ms: 600_000,
        }
    }
}

/// What the breaker lets through right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed: deliver normally.
    Allow,
    /// Circuit half-open: this caller carries the single probe.
    Probe,
    /// Circuit open (or a probe is already in flight): dead-letter.
    Reject,
}

pub struct CircuitBreaker {
    config: CircuitConfig,
    state: CircuitState,
    successes: SlidingWindow,
    failures: SlidingWindow,
    opened_at_ms: u64,
    current_cooldown_ms: u64,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            successes: SlidingWindow::new(config.window_ms),
            failures: SlidingWindow::new(config.window_ms),
            state: CircuitState::Closed,
            opened_at_ms: 0,
            current_cooldown_ms: config.cooldown_ms,
            probe_in_flight: false,
            config,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Decide whether a delivery may proceed at `now_ms`.
    pub fn check(&mut self, now_ms: u64) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allow,
            CircuitState::Open => {
                if now_ms >= self.opened_at_ms.saturating_add(self.current_cooldown_ms) {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    Admission::Probe
                } else {
                    Admission::Reject
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Admission::Reject
                } else {
                    self.probe_in_flight = true;
                    Admission::Probe
                }
            }
        }
    }

    /// Record a delivery outcome at `now_ms`.
    pub fn record(&mut self, now_ms: u64, ok: bool) {
        match self.state {
            CircuitState::Closed => {
                if ok {
                    self.successes.record(now_ms, 1);
                } else {
                    self.failures.record(now_ms, 1);
                }
                let failures = self.failures.sum(now_ms);
                let total = failures + self.successes.sum(now_ms);
                if total >= self.config.min_samples
                    && failures * 100 > total * self.config.error_rate_pct as u64
                {
                    self.trip(now_ms);
                }
            }
            CircuitState::HalfOpen => {
                self.probe_in_flight = false;
                if ok {
                    self.reset();
                } else {
                    self.current_cooldown_ms =
                        (self.current_cooldown_ms * 2).min(self.config.max_cooldown_ms);
                    self.state = CircuitState::Open;
                    self.opened_at_ms = now_ms;
                }
            }
            // Outcomes racing a trip are ignored; the circuit is already open.
            CircuitState::Open => {}
        }
    }

    fn trip(&mut self, now_ms: u64) {
        self.state = CircuitState::Open;
        self.opened_at_ms = now_ms;
        self.current_cooldown_ms = self.config.cooldown_ms;
    }

    fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.current_cooldown_ms = self.config.cooldown_ms;
        self.successes = SlidingWindow::new(self.config.window_ms);
        self.failures = SlidingWindow::new(self.config.window_ms);
    }
}

#[cfg(test)]
#[path = "circuit_tests.rs"]
mod tests;
