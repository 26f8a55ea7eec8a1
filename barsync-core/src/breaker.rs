//! Per-provider circuit breaker.
//!
//! One breaker wraps every external call to one provider. All in-flight
//! symbols share the same breaker, so a failing provider is isolated
//! engine-wide after `failure_threshold` consecutive failures rather than
//! once per symbol. State transitions are serialized behind a single mutex.

use crate::provider::ProviderError;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation: calls pass through.
    Closed,
    /// Tripped: calls are rejected until the recovery timeout expires.
    Open,
    /// Probing: a limited number of trial calls decide open vs. closed.
    HalfOpen,
}

#[derive(Debug)]
enum Phase {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { trial_calls: u32, successes: u32 },
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    consecutive_failures: u32,
}

/// Circuit breaker guarding a single provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: &'static str,
    inner: Mutex<Inner>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_calls: u32,
}

impl CircuitBreaker {
    pub fn new(
        provider: &'static str,
        failure_threshold: u32,
        recovery_timeout: Duration,
        half_open_max_calls: u32,
    ) -> Self {
        Self {
            provider,
            inner: Mutex::new(Inner {
                phase: Phase::Closed,
                consecutive_failures: 0,
            }),
            failure_threshold,
            recovery_timeout,
            half_open_max_calls: half_open_max_calls.max(1),
        }
    }

    /// Default breaker: trips after 5 consecutive failures, 60 s recovery,
    /// 3 half-open trial calls.
    pub fn default_provider(provider: &'static str) -> Self {
        Self::new(provider, 5, Duration::from_secs(60), 3)
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    /// Gate an outgoing call.
    ///
    /// Returns `Ok` if the call may proceed. Performs the Open → HalfOpen
    /// transition once the recovery timeout has elapsed; the passing call is
    /// the first trial. In HalfOpen, calls beyond the trial budget are
    /// rejected until the in-flight trials are recorded.
    pub fn check(&self) -> Result<(), ProviderError> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        match inner.phase {
            Phase::Closed => Ok(()),
            Phase::Open { opened_at } => {
                if opened_at.elapsed() >= self.recovery_timeout {
                    inner.phase = Phase::HalfOpen {
                        trial_calls: 1,
                        successes: 0,
                    };
                    Ok(())
                } else {
                    Err(ProviderError::CircuitOpen {
                        provider: self.provider,
                    })
                }
            }
            Phase::HalfOpen {
                ref mut trial_calls,
                ..
            } => {
                if *trial_calls < self.half_open_max_calls {
                    *trial_calls += 1;
                    Ok(())
                } else {
                    Err(ProviderError::CircuitOpen {
                        provider: self.provider,
                    })
                }
            }
        }
    }

    /// Record a successful call.
    ///
    /// Closed: clears the failure counter. HalfOpen: counts toward the
    /// consecutive successes needed to close.
    pub fn record_success(&self) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        match inner.phase {
            Phase::Closed => inner.consecutive_failures = 0,
            Phase::HalfOpen { ref mut successes, .. } => {
                *successes += 1;
                if *successes >= self.half_open_max_calls {
                    inner.phase = Phase::Closed;
                    inner.consecutive_failures = 0;
                }
            }
            // Late success from a call that raced the trip; ignore.
            Phase::Open { .. } => {}
        }
    }

    /// Record a failed call.
    ///
    /// Closed: increments the consecutive counter and trips at the
    /// threshold. HalfOpen: any failure reopens immediately with a fresh
    /// recovery window.
    pub fn record_failure(&self) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        match inner.phase {
            Phase::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.phase = Phase::Open {
                        opened_at: Instant::now(),
                    };
                }
            }
            Phase::HalfOpen { .. } => {
                inner.phase = Phase::Open {
                    opened_at: Instant::now(),
                };
            }
            Phase::Open { .. } => {}
        }
    }

    /// Current state, observing the recovery timeout but not consuming a
    /// trial call.
    pub fn state(&self) -> BreakerState {
        let inner = self.inner.lock().unwrap();
        match inner.phase {
            Phase::Closed => BreakerState::Closed,
            Phase::Open { opened_at } => {
                if opened_at.elapsed() >= self.recovery_timeout {
                    // The next check() will move to HalfOpen.
                    BreakerState::HalfOpen
                } else {
                    BreakerState::Open
                }
            }
            Phase::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Remaining recovery time (zero unless Open).
    pub fn remaining_cooldown(&self) -> Duration {
        let inner = self.inner.lock().unwrap();
        match inner.phase {
            Phase::Open { opened_at } => {
                self.recovery_timeout.saturating_sub(opened_at.elapsed())
            }
            _ => Duration::ZERO,
        }
    }
}
