// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Failure-counting circuit breaker for outbound publishes.

use std::time::{Duration, Instant};

/// Consecutive failures that trip the breaker open.
pub const OPEN_THRESHOLD: u32 = 5;

/// How long an open breaker rejects publishes before permitting a trial.
pub const OPEN_COOLDOWN: Duration = Duration::from_secs(30);

/// Consecutive half-open successes that close the breaker again.
pub const CLOSE_SUCCESSES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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

/// Three-state breaker. Mutated only by its owning client's loop; callers
/// hold it behind a mutex and never across an await.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    threshold: u32,
    cooldown: Duration,
    close_successes: u32,
}

impl CircuitBreaker {
    /// The foreground policy: 5 failures, 30 s cooldown, 2 trial successes.
    pub fn new() -> Self {
        Self::with_policy(OPEN_THRESHOLD, OPEN_COOLDOWN, CLOSE_SUCCESSES)
    }

    /// Custom policy, e.g. the background task's simpler 5-failure/60 s
    /// variant that closes after a single trial success.
    pub fn with_policy(threshold: u32, cooldown: Duration, close_successes: u32) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: None,
            threshold,
            cooldown,
            close_successes,
        }
    }

    /// Whether a request may be issued now. An open breaker whose cooldown
    /// has elapsed transitions to half-open and admits the trial call.
    pub fn allows_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed =
                    self.opened_at.map(|at| at.elapsed() >= self.cooldown).unwrap_or(true);
                if elapsed {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.close_successes {
                    self.state = CircuitState::Closed;
                    self.consecutive_failures = 0;
                    self.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.threshold {
                    self.trip();
                }
            }
            // Any half-open failure restarts the cooldown.
            CircuitState::HalfOpen => self.trip(),
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    fn trip(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_successes = 0;
        tracing::warn!(failures = self.consecutive_failures, "circuit opened");
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "circuit_tests.rs"]
mod tests;
