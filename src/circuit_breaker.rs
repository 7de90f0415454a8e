//! Circuit breaker guarding DB Pool calls.
//!
//! A finite-state machine over one guarded operation family: `closed` allows
//! calls through, `open` fails calls fast without touching the callee,
//! `half-open` admits exactly one probe at a time to test recovery. Failure
//! classification is caller-supplied (`is_breaker_failure`) so business
//! outcomes like "row not found" never trip the breaker — only
//! transport/availability failures do.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_probe_in_flight: bool,
}

/// Guards one operation family behind a single mutex-mediated state machine.
///
/// `cached_state` mirrors `inner.state` and is read with `Ordering::Relaxed`
/// on the fast path; the lock is only taken to recheck on a possible
/// transition boundary (open -> half-open cooldown elapsed, or any write).
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    cached_state: AtomicU8,
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit open")]
    Open,
    #[error(transparent)]
    Call(E),
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_probe_in_flight: false,
            }),
            cached_state: AtomicU8::new(CircuitState::Closed.as_u8()),
        }
    }

    /// Execute `f` under breaker protection. `is_breaker_failure` classifies
    /// which `Err` variants count as availability failures versus business
    /// outcomes that should pass through without affecting breaker state.
    pub async fn call<F, Fut, T, E>(
        &self,
        is_breaker_failure: impl Fn(&E) -> bool,
        f: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.admit() {
            return Err(CircuitBreakerError::Open);
        }

        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                if is_breaker_failure(&err) {
                    self.on_failure();
                } else {
                    self.release_probe_if_half_open();
                }
                Err(CircuitBreakerError::Call(err))
            }
        }
    }

    /// Fast path: relaxed read of the cached state. Only falls through to
    /// the mutex when a transition boundary is plausible.
    fn admit(&self) -> bool {
        match CircuitState::from_u8(self.cached_state.load(Ordering::Relaxed)) {
            CircuitState::Closed => true,
            CircuitState::HalfOpen | CircuitState::Open => self.admit_slow(),
        }
    }

    fn admit_slow(&self) -> bool {
        let mut guard = self.lock();
        match guard.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = guard.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.cooldown {
                    guard.state = CircuitState::HalfOpen;
                    guard.half_open_probe_in_flight = true;
                    self.cached_state.store(guard.state.as_u8(), Ordering::Relaxed);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if guard.half_open_probe_in_flight {
                    false
                } else {
                    guard.half_open_probe_in_flight = true;
                    true
                }
            }
        }
    }

    fn on_success(&self) {
        let mut guard = self.lock();
        match guard.state {
            CircuitState::Closed => {
                guard.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                guard.state = CircuitState::Closed;
                guard.consecutive_failures = 0;
                guard.opened_at = None;
                guard.half_open_probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
        self.cached_state.store(guard.state.as_u8(), Ordering::Relaxed);
    }

    fn on_failure(&self) {
        let mut guard = self.lock();
        match guard.state {
            CircuitState::Closed => {
                guard.consecutive_failures += 1;
                if guard.consecutive_failures >= self.config.failure_threshold {
                    guard.state = CircuitState::Open;
                    guard.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                guard.state = CircuitState::Open;
                guard.opened_at = Some(Instant::now());
                guard.half_open_probe_in_flight = false;
            }
            CircuitState::Open => {}
        }
        self.cached_state.store(guard.state.as_u8(), Ordering::Relaxed);
    }

    fn release_probe_if_half_open(&self) {
        let mut guard = self.lock();
        if guard.state == CircuitState::HalfOpen {
            guard.half_open_probe_in_flight = false;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// 0=closed, 1=half-open, 2=open, matching the Observability Hub's
    /// `breaker.state` gauge.
    pub fn state_gauge(&self) -> u8 {
        self.cached_state.load(Ordering::Relaxed)
    }
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

pub type SharedCircuitBreaker = Arc<CircuitBreaker>;
