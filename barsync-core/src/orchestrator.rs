//! Fallback orchestrator: resolves one symbol across prioritized providers.
//!
//! Providers are tried in priority order, each behind its own circuit
//! breaker. A provider that answers with enough bars wins immediately; one
//! that answers with too few is remembered as a candidate while the next
//! source is tried, and the best candidate (most bars) is returned if nobody
//! clears the sufficiency bar. Partial history is still worth storing.

use crate::breaker::CircuitBreaker;
use crate::provider::{FetchResult, Provider, ProviderError};
use chrono::{Datelike, NaiveDate, Weekday};
use std::sync::Arc;
use std::time::Duration;

/// Minimum bar count a range should produce, derived from weekday count.
///
/// Holidays make the theoretical count unreachable, so a sufficiency ratio
/// (typically 0.8) discounts it. Always at least 1.
pub fn min_expected_records(start: NaiveDate, end: NaiveDate, sufficiency_ratio: f64) -> usize {
    let mut weekdays = 0u32;
    let mut day = start;
    while day <= end {
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            weekdays += 1;
        }
        day = match day.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    ((weekdays as f64 * sufficiency_ratio).floor() as usize).max(1)
}

/// A provider paired with the breaker that guards it.
pub struct GuardedProvider {
    pub provider: Arc<dyn Provider>,
    pub breaker: CircuitBreaker,
}

impl GuardedProvider {
    pub fn new(provider: Arc<dyn Provider>, breaker: CircuitBreaker) -> Self {
        Self { provider, breaker }
    }
}

/// Resolves symbols against a priority-ordered provider list.
pub struct FallbackOrchestrator {
    providers: Vec<GuardedProvider>,
    sufficiency_ratio: f64,
}

impl FallbackOrchestrator {
    pub fn new(providers: Vec<GuardedProvider>, sufficiency_ratio: f64) -> Self {
        Self {
            providers,
            sufficiency_ratio,
        }
    }

    /// The guarded providers, in priority order.
    pub fn providers(&self) -> &[GuardedProvider] {
        &self.providers
    }

    /// Baseline delay of the highest-priority provider; the post-symbol
    /// sleep when no provider served.
    pub fn primary_delay(&self) -> Duration {
        self.providers
            .first()
            .map(|gp| gp.provider.rate_limit_delay())
            .unwrap_or(Duration::ZERO)
    }

    /// Baseline rate-limit delay of the named serving provider (for the
    /// driver's post-symbol sleep). Unknown names fall back to the primary.
    pub fn delay_for_source(&self, source: &str) -> Duration {
        self.providers
            .iter()
            .find(|gp| gp.provider.name() == source)
            .map(|gp| gp.provider.rate_limit_delay())
            .unwrap_or_else(|| self.primary_delay())
    }

    /// Resolve one symbol over an inclusive date range.
    ///
    /// Returns the first sufficient result, else the largest insufficient
    /// candidate, else `NoDataAvailable`. The error also carries which
    /// provider was last attempted via logging only; callers treat any
    /// returned error as a per-symbol failure, never run-fatal.
    pub fn resolve(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<FetchResult, ProviderError> {
        let expected = min_expected_records(start, end, self.sufficiency_ratio);
        let mut best_candidate: Option<FetchResult> = None;

        for guarded in &self.providers {
            let name = guarded.provider.name();
            if guarded.breaker.check().is_err() {
                log::debug!("{symbol}: skipping {name}, circuit open");
                continue;
            }

            match guarded.provider.fetch_historical(symbol, start, end) {
                Ok(bars) => {
                    guarded.breaker.record_success();
                    if bars.is_empty() {
                        continue;
                    }
                    if bars.len() >= expected {
                        return Ok(FetchResult {
                            symbol: symbol.to_string(),
                            bars,
                            source: name,
                        });
                    }
                    log::debug!(
                        "{symbol}: {name} returned {} bars, expected >= {expected}",
                        bars.len()
                    );
                    let better = best_candidate
                        .as_ref()
                        .map_or(true, |c| bars.len() > c.bars.len());
                    if better {
                        best_candidate = Some(FetchResult {
                            symbol: symbol.to_string(),
                            bars,
                            source: name,
                        });
                    }
                }
                Err(err) => {
                    if err.penalizes_breaker() {
                        guarded.breaker.record_failure();
                    }
                    log::debug!("{symbol}: {name} failed: {err}");
                }
            }
        }

        match best_candidate {
            Some(candidate) => {
                log::info!(
                    "{symbol}: accepting partial result from {} ({} bars, wanted {expected})",
                    candidate.source,
                    candidate.bars.len()
                );
                Ok(candidate)
            }
            None => Err(ProviderError::NoDataAvailable {
                symbol: symbol.to_string(),
            }),
        }
    }
}
