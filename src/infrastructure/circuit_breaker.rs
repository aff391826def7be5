//! Circuit breaker for KV and bus round-trips
//!
//! `closed → open` after N consecutive failures, `open → half-open` after
//! a cool-down, `half-open → closed` after M consecutive successes. The
//! open state fast-fails without calling the downstream. Every guarded
//! operation also carries a fail-fast deadline.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

/// Breaker thresholds and deadlines
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    /// How long the breaker stays open before probing.
    pub cooldown: Duration,
    /// Fail-fast deadline applied to each guarded operation.
    pub op_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(10),
            op_timeout: Duration::from_millis(1_500),
        }
    }
}

#[derive(Debug)]
enum State {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { successes: u32 },
}

/// Failure surfaced by a guarded operation
#[derive(Debug)]
pub enum GuardError<E> {
    /// Breaker is open; the downstream was not called.
    Open,
    /// The operation exceeded the fail-fast deadline.
    Timeout,
    /// The operation itself failed.
    Inner(E),
}

/// Shared circuit breaker. One instance protects one downstream.
pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(State::Closed { failures: 0 }),
        }
    }

    /// Run `operation` under the breaker and the configured deadline.
    pub async fn run<T, E, Fut>(&self, operation: Fut) -> Result<T, GuardError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            return Err(GuardError::Open);
        }

        match tokio::time::timeout(self.config.op_timeout, operation).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record_failure();
                Err(GuardError::Inner(e))
            }
            Err(_) => {
                self.record_failure();
                Err(GuardError::Timeout)
            }
        }
    }

    /// Whether a call may proceed. Open transitions to half-open once the
    /// cool-down has elapsed.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            State::Closed { .. } | State::HalfOpen { .. } => true,
            State::Open { since } => {
                if since.elapsed() >= self.config.cooldown {
                    *state = State::HalfOpen { successes: 0 };
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *state {
            State::Closed { failures } => *failures = 0,
            State::HalfOpen { successes } => {
                *successes += 1;
                if *successes >= self.config.success_threshold {
                    *state = State::Closed { failures: 0 };
                }
            }
            State::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *state {
            State::Closed { failures } => {
                *failures += 1;
                if *failures >= self.config.failure_threshold {
                    warn!(breaker = self.name, "Circuit breaker opened");
                    *state = State::Open { since: Instant::now() };
                }
            }
            // Any half-open failure reopens immediately.
            State::HalfOpen { .. } => {
                warn!(breaker = self.name, "Circuit breaker reopened from half-open");
                *state = State::Open { since: Instant::now() };
            }
            State::Open { .. } => {}
        }
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        matches!(
            &*self.state.lock().unwrap_or_else(|e| e.into_inner()),
            State::Open { .. }
        )
    }
}
