//! # Circuit Breaker
//!
//! Protects the work-queue and knowledge-store facades from hammering a
//! failing backend. Standard three-state machine:
//!
//! - **Closed**: calls flow; consecutive failures are counted.
//! - **Open**: calls fail fast until the recovery timeout elapses.
//! - **Half-open**: a probe window; enough successes close the circuit,
//!   any failure reopens it.
//!
//! Concrete type, no trait object — consumers hold `Arc<CircuitBreaker>`.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Successes required in half-open before closing
    pub success_threshold: u32,
    /// How long the circuit stays open before probing
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Snapshot for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub last_latency_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    success_count: u64,
    failure_count: u64,
    opened_at: Option<Instant>,
    last_latency: Option<Duration>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                success_count: 0,
                failure_count: 0,
                opened_at: None,
                last_latency: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Gate a call before attempting work. Open circuits start a probe once
    /// the recovery timeout has elapsed.
    pub fn should_allow(&self) -> bool {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.timeout)
                    .unwrap_or(true);
                if elapsed {
                    info!(breaker = %self.name, "circuit half-open, probing");
                    state.state = CircuitState::HalfOpen;
                    state.half_open_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, duration: Duration) {
        let mut state = self.lock();
        state.success_count += 1;
        state.consecutive_failures = 0;
        state.last_latency = Some(duration);
        if state.state == CircuitState::HalfOpen {
            state.half_open_successes += 1;
            if state.half_open_successes >= self.config.success_threshold {
                info!(breaker = %self.name, "circuit closed");
                state.state = CircuitState::Closed;
                state.opened_at = None;
            }
        }
    }

    pub fn record_failure(&self, duration: Duration) {
        let mut state = self.lock();
        state.failure_count += 1;
        state.consecutive_failures += 1;
        state.last_latency = Some(duration);
        let should_open = match state.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => state.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open {
            warn!(
                breaker = %self.name,
                consecutive_failures = state.consecutive_failures,
                "circuit opened"
            );
            state.state = CircuitState::Open;
            state.opened_at = Some(Instant::now());
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Emergency kill switch.
    pub fn force_open(&self) {
        let mut state = self.lock();
        state.state = CircuitState::Open;
        state.opened_at = Some(Instant::now());
    }

    /// Emergency recovery.
    pub fn force_closed(&self) {
        let mut state = self.lock();
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.lock();
        CircuitBreakerMetrics {
            state: state.state,
            success_count: state.success_count,
            failure_count: state.failure_count,
            consecutive_failures: state.consecutive_failures,
            last_latency_ms: state.last_latency.map(|d| d.as_millis() as u64),
        }
    }
}
