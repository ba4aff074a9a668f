//! Circuit breaker for backend protection.
//!
//! # States
//! - Closed: normal operation, attempts pass through
//! - Open: backend assumed down, attempts fail fast
//! - Half-Open: a bounded number of probes test whether it recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: counted failures within the trailing window >= threshold
//! Open → Half-Open: lazily, on the first query once open_duration elapsed
//! Half-Open → Closed: success_threshold_to_close consecutive successes
//! Half-Open → Open: any counted failure
//! ```
//!
//! Only `transient` and `resource` failures are counted. `permanent` and
//! `timeout` failures are recorded as calls but never move the state.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::backend::ErrorClassification;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub window: Duration,
    pub open_duration: Duration,
    pub half_open_max_attempts: u32,
    pub success_threshold_to_close: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            open_duration: Duration::from_secs(30),
            half_open_max_attempts: 1,
            success_threshold_to_close: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        };
        write!(f, "{s}")
    }
}

/// Window-pruned view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStats {
    pub state: CircuitState,
    pub window_failures: usize,
    pub window_calls: usize,
    pub half_open_successes: u32,
    pub half_open_in_flight: u32,
    pub last_transition: DateTime<Utc>,
}

struct Inner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    calls: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    half_open_in_flight: u32,
    last_transition: DateTime<Utc>,
}

impl Inner {
    fn prune(&mut self, now: Instant, window: Duration) {
        for queue in [&mut self.failures, &mut self.calls] {
            while queue
                .front()
                .is_some_and(|t| now.saturating_duration_since(*t) >= window)
            {
                queue.pop_front();
            }
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                calls: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
                half_open_in_flight: 0,
                last_transition: Utc::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Counters stay consistent under every early exit, so a poisoned lock is usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state, applying the lazy Open → Half-Open transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    /// Admission check. In Half-Open, admitting reserves one probe slot that
    /// the next recorded outcome (or `abandon_probe`) gives back.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_attempts {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Give back a Half-Open probe slot for an attempt that never ran.
    pub fn abandon_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    pub fn record_success(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        inner.calls.push_back(now);
        inner.prune(now, self.config.window);

        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            inner.half_open_successes += 1;
            if inner.half_open_successes >= self.config.success_threshold_to_close {
                self.transition(&mut inner, CircuitState::Closed, now);
            }
        }
    }

    pub fn record_failure(&self, classification: ErrorClassification) {
        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        inner.calls.push_back(now);

        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
        if !classification.counts_toward_breaker() {
            inner.prune(now, self.config.window);
            return;
        }

        inner.failures.push_back(now);
        inner.prune(now, self.config.window);

        match inner.state {
            CircuitState::Closed => {
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open, now),
            CircuitState::Open => {}
        }
    }

    pub fn stats(&self) -> CircuitStats {
        let now = Instant::now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        inner.prune(now, self.config.window);
        CircuitStats {
            state: inner.state,
            window_failures: inner.failures.len(),
            window_calls: inner.calls.len(),
            half_open_successes: inner.half_open_successes,
            half_open_in_flight: inner.half_open_in_flight,
            last_transition: inner.last_transition,
        }
    }

    fn refresh(&self, inner: &mut Inner, now: Instant) {
        if inner.state == CircuitState::Open
            && inner
                .opened_at
                .is_some_and(|at| now.saturating_duration_since(at) >= self.config.open_duration)
        {
            self.transition(inner, CircuitState::HalfOpen, now);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, now: Instant) {
        let from = inner.state;
        inner.state = to;
        inner.last_transition = Utc::now();
        inner.half_open_successes = 0;
        inner.half_open_in_flight = 0;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(now);
                tracing::warn!(
                    breaker = %self.name,
                    %from,
                    failures = inner.failures.len(),
                    "Circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                tracing::info!(breaker = %self.name, "Circuit half-open, probing");
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.failures.clear();
                inner.calls.clear();
                tracing::info!(breaker = %self.name, "Circuit closed");
            }
        }
    }
}
