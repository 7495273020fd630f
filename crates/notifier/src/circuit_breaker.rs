//! Per-provider circuit breaker.
//!
//! # States
//! - Closed: calls pass through; failures are counted
//! - Open: calls fail fast without touching the provider until `recovery_time` elapses
//! - Half-Open: the next call is let through as a trial
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= failure_threshold
//! Open → Half-Open: first call after opened_until
//! Half-Open → Closed: trial call succeeds
//! Half-Open → Open: trial call fails
//! ```
//!
//! Half-Open does not limit concurrent trials: every caller that arrives while the
//! breaker is half-open is let through. The lock is never held across the call.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

/// Default consecutive failures before the circuit opens.
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time an open circuit rejects calls.
const DEFAULT_RECOVERY_TIME: Duration = Duration::from_millis(10_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures required to open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial call is allowed
    pub recovery_time: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_time: DEFAULT_RECOVERY_TIME,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Outcome of a guarded call that did not produce a value.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Rejected without invoking the operation.
    #[error("circuit is open, next trial in {retry_in:?}")]
    Open { retry_in: Duration },

    /// The operation ran and failed; already counted against the breaker.
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct BreakerData {
    state: CircuitState,
    failure_count: u32,
    opened_until: Instant,
}

/// Circuit breaker guarding one provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    data: Mutex<BreakerData>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            data: Mutex::new(BreakerData {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_until: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.data.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.data.lock().failure_count
    }

    /// Run `operation` under the breaker.
    ///
    /// The operation's error is handed back as `BreakerError::Inner` after it has
    /// been counted; nothing is swallowed.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Err(retry_in) = self.admit() {
            return Err(BreakerError::Open { retry_in });
        }

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Decide whether a call may proceed; `Err` carries the time left in the open window.
    fn admit(&self) -> Result<(), Duration> {
        let mut data = self.data.lock();
        if data.state != CircuitState::Open {
            return Ok(());
        }

        let now = Instant::now();
        if now < data.opened_until {
            return Err(data.opened_until - now);
        }

        data.state = CircuitState::HalfOpen;
        tracing::info!(
            provider = %self.name,
            state = %data.state,
            "Circuit breaker half-open, allowing trial call"
        );
        Ok(())
    }

    fn on_success(&self) {
        let mut data = self.data.lock();
        let previous = data.state;
        data.failure_count = 0;
        data.state = CircuitState::Closed;

        if previous != CircuitState::Closed {
            tracing::info!(
                provider = %self.name,
                from = %previous,
                state = %data.state,
                "Circuit breaker closed, provider recovered"
            );
        }
    }

    fn on_failure(&self) {
        let mut data = self.data.lock();
        data.failure_count = data.failure_count.saturating_add(1);

        if data.failure_count >= self.config.failure_threshold {
            let previous = data.state;
            data.state = CircuitState::Open;
            data.opened_until = Instant::now() + self.config.recovery_time;

            if previous != CircuitState::Open {
                tracing::warn!(
                    provider = %self.name,
                    from = %previous,
                    state = %data.state,
                    failure_count = data.failure_count,
                    threshold = self.config.failure_threshold,
                    recovery_ms = self.config.recovery_time.as_millis() as u64,
                    "Circuit breaker opened"
                );
            }
        }
    }
}
