//! Provider trait and structured error taxonomy.
//!
//! The Provider trait abstracts over external market-data sources (JSON
//! chart API, CSV-over-HTTP) so the orchestrator can fall back between them
//! and tests can substitute fakes. A provider never panics on bad input:
//! every failure mode is one of the typed variants below, because the
//! orchestrator's retry/fallback/give-up decisions key off the variant.

pub mod chart_api;
pub mod csv_api;

use crate::domain::Bar;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Structured error types for provider and sync operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Provider refused the call for rate reasons; retry after the hint.
    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    /// Network, timeout, or parse failure: worth trying another provider.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The symbol is unknown to this provider (not a provider outage).
    #[error("symbol not found: {symbol}")]
    NotFound { symbol: String },

    /// The call succeeded but returned zero rows.
    #[error("provider returned no data for {symbol}")]
    NoData { symbol: String },

    /// The call succeeded but returned fewer bars than the range implies.
    #[error("insufficient data: got {got} bars, expected at least {expected}")]
    InsufficientData { got: usize, expected: usize },

    /// The provider's circuit breaker is open; no network call was made.
    #[error("circuit open for provider {provider}")]
    CircuitOpen { provider: &'static str },

    /// Bars failed sanity checks (negative prices, inverted OHLC, ...).
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Terminal per-symbol outcome: no provider produced usable data.
    #[error("no data available for {symbol} from any provider")]
    NoDataAvailable { symbol: String },
}

impl ProviderError {
    /// Whether this outcome should count against the provider's breaker.
    ///
    /// NotFound/NoData mean the symbol is absent from the source, not that
    /// the source is down, so they carry no penalty.
    pub fn penalizes_breaker(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Transient(_)
        )
    }
}

/// Result of a successful fetch for a single symbol.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub symbol: String,
    /// Chronological, no duplicate dates.
    pub bars: Vec<Bar>,
    /// Identifier of the provider that served the data.
    pub source: &'static str,
}

/// A single external market-data source with its own rate characteristics.
pub trait Provider: Send + Sync {
    /// Stable identifier for logs, breakers, and the bar store's source column.
    fn name(&self) -> &'static str;

    /// Fetch daily bars for one symbol over an inclusive date range.
    fn fetch_historical(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, ProviderError>;

    /// Best-effort batch fetch: partial results allowed, failures dropped.
    ///
    /// The default implementation loops `fetch_historical` and keeps the
    /// successes; batch-capable providers override this.
    fn fetch_batch(
        &self,
        symbols: &[&str],
        start: NaiveDate,
        end: NaiveDate,
    ) -> HashMap<String, Vec<Bar>> {
        let mut out = HashMap::new();
        for symbol in symbols {
            if let Ok(bars) = self.fetch_historical(symbol, start, end) {
                out.insert(symbol.to_string(), bars);
            }
        }
        out
    }

    /// Baseline delay the caller should wait after every call to this source.
    fn rate_limit_delay(&self) -> Duration;

    /// How many symbols one network call can cover (1 for per-symbol APIs).
    fn batch_size(&self) -> usize {
        1
    }
}
