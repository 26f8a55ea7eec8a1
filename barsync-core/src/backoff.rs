//! Inter-call delay policy: per-provider baseline plus failure escalation.
//!
//! The baseline after every symbol is whatever the serving provider's rate
//! limit demands. On top of that, the policy tracks consecutive
//! whole-pipeline failures (across providers); once they exceed a threshold
//! the delay doubles per further failure up to a cap, with a little jitter
//! so resumed runs don't retry in lockstep. A single success returns the
//! delay to baseline. This keeps the engine from hammering a degraded
//! upstream even while breakers are cycling open and closed.

use rand::Rng;
use std::sync::Mutex;
use std::time::Duration;

/// Escalating backoff over a per-provider baseline delay.
#[derive(Debug)]
pub struct BackoffPolicy {
    consecutive_failures: Mutex<u32>,
    failure_threshold: u32,
    max_delay: Duration,
    jitter_fraction: f64,
}

impl BackoffPolicy {
    pub fn new(failure_threshold: u32, max_delay: Duration) -> Self {
        Self {
            consecutive_failures: Mutex::new(0),
            failure_threshold,
            max_delay,
            jitter_fraction: 0.1,
        }
    }

    /// Default policy: escalate after 5 consecutive failures, cap at 60 s.
    pub fn default_policy() -> Self {
        Self::new(5, Duration::from_secs(60))
    }

    /// Record a whole-pipeline failure (no provider served the symbol).
    pub fn record_failure(&self) {
        *self.consecutive_failures.lock().unwrap() += 1;
    }

    /// Record a successful symbol; the next delay returns to baseline.
    pub fn record_success(&self) {
        *self.consecutive_failures.lock().unwrap() = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        *self.consecutive_failures.lock().unwrap()
    }

    /// Delay to sleep after a call whose provider baseline is `base`.
    ///
    /// At or below the threshold this is `base` exactly. Beyond it, the
    /// delay doubles per excess failure, capped at `max_delay`, plus up to
    /// 10% jitter (also capped). Never below `base`.
    pub fn delay_for(&self, base: Duration) -> Duration {
        let failures = *self.consecutive_failures.lock().unwrap();
        let scaled = self.scaled_delay(base, failures);
        if scaled == base {
            return base;
        }
        let jitter_max = scaled.as_secs_f64() * self.jitter_fraction;
        let jitter = Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=jitter_max));
        (scaled + jitter).min(self.max_delay).max(base)
    }

    /// Deterministic part of the delay (no jitter); exposed for tests.
    pub fn scaled_delay(&self, base: Duration, failures: u32) -> Duration {
        if failures <= self.failure_threshold {
            return base;
        }
        let excess = (failures - self.failure_threshold).min(16);
        let factor = 2u32.saturating_pow(excess);
        base.saturating_mul(factor).min(self.max_delay).max(base)
    }
}
