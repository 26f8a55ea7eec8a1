//! Primary provider: JSON chart API (Yahoo v8-style endpoint).
//!
//! Fetches daily OHLCV bars from a `/v8/finance/chart/{symbol}` endpoint.
//! The endpoint has no official contract and rate-limits aggressively, which
//! is why it sits behind the orchestrator's circuit breaker and carries the
//! larger per-call delay. Failure modes map onto the typed taxonomy:
//! 429 → RateLimited (honoring `retry-after`), missing symbol → NotFound,
//! connect/timeout/parse → Transient.

use crate::domain::Bar;
use crate::provider::{Provider, ProviderError};
use chrono::NaiveDate;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://query2.finance.yahoo.com/v8/finance/chart";

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
    adjclose: Option<Vec<AdjCloseData>>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<u64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    adjclose: Vec<Option<f64>>,
}

/// JSON chart API provider.
pub struct ChartApiProvider {
    client: reqwest::blocking::Client,
    base_url: String,
    rate_limit_delay: Duration,
    retry_attempts: u32,
    retry_base_delay: Duration,
}

impl ChartApiProvider {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Point the provider at a different endpoint (test servers).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            base_url: base_url.into(),
            rate_limit_delay: Duration::from_millis(1500),
            retry_attempts: 2,
            retry_base_delay: Duration::from_millis(500),
        }
    }

    fn chart_url(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> String {
        let start_ts = start
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0);
        let end_ts = end
            .and_hms_opt(23, 59, 59)
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0);
        format!(
            "{}/{symbol}?period1={start_ts}&period2={end_ts}&interval=1d&includeAdjustedClose=true",
            self.base_url
        )
    }

    fn parse_response(symbol: &str, resp: ChartResponse) -> Result<Vec<Bar>, ProviderError> {
        let result = resp.chart.result.ok_or_else(|| {
            if let Some(err) = resp.chart.error {
                if err.code == "Not Found" {
                    ProviderError::NotFound {
                        symbol: symbol.to_string(),
                    }
                } else {
                    ProviderError::Transient(format!("{}: {}", err.code, err.description))
                }
            } else {
                ProviderError::Transient("empty result with no error".into())
            }
        })?;

        let data = result
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Transient("result array is empty".into()))?;

        let timestamps = data
            .timestamp
            .ok_or_else(|| ProviderError::NoData {
                symbol: symbol.to_string(),
            })?;

        let quote = data
            .indicators
            .quote
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Transient("no quote data".into()))?;

        let adj_closes = data
            .indicators
            .adjclose
            .and_then(|v| v.into_iter().next())
            .map(|a| a.adjclose);

        let mut bars = Vec::with_capacity(timestamps.len());
        for (i, &ts) in timestamps.iter().enumerate() {
            let date = chrono::DateTime::from_timestamp(ts, 0)
                .map(|dt| dt.naive_utc().date())
                .ok_or_else(|| ProviderError::Transient(format!("invalid timestamp: {ts}")))?;

            let open = quote.open.get(i).copied().flatten();
            let high = quote.high.get(i).copied().flatten();
            let low = quote.low.get(i).copied().flatten();
            let close = quote.close.get(i).copied().flatten();
            let volume = quote.volume.get(i).copied().flatten();
            let adj_close = adj_closes.as_ref().and_then(|v| v.get(i).copied().flatten());

            // All-None rows are holidays/half-days; skip them.
            if open.is_none() && high.is_none() && low.is_none() && close.is_none() {
                continue;
            }

            bars.push(Bar {
                symbol: symbol.to_string(),
                date,
                open: open.unwrap_or(f64::NAN),
                high: high.unwrap_or(f64::NAN),
                low: low.unwrap_or(f64::NAN),
                close: close.unwrap_or(f64::NAN),
                adj_close: adj_close.or(close).unwrap_or(f64::NAN),
                volume: volume.unwrap_or(0),
            });
        }

        if bars.is_empty() {
            return Err(ProviderError::NoData {
                symbol: symbol.to_string(),
            });
        }

        Ok(bars)
    }

    /// One request with a short retry loop for connection-level blips.
    ///
    /// Classified failures (rate limit, not found) return immediately; only
    /// connect/timeout errors are retried here, everything beyond that is
    /// the orchestrator's job.
    fn fetch_once(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, ProviderError> {
        let url = self.chart_url(symbol, start, end);
        let mut last_error = None;

        for attempt in 0..=self.retry_attempts {
            if attempt > 0 {
                std::thread::sleep(self.retry_base_delay * 2u32.pow(attempt - 1));
            }

            match self.client.get(&url).send() {
                Ok(resp) => {
                    let status = resp.status();

                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        let retry_after = resp
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(60);
                        return Err(ProviderError::RateLimited {
                            retry_after_secs: retry_after,
                        });
                    }

                    if status == reqwest::StatusCode::NOT_FOUND {
                        return Err(ProviderError::NotFound {
                            symbol: symbol.to_string(),
                        });
                    }

                    if !status.is_success() {
                        return Err(ProviderError::Transient(format!(
                            "HTTP {status} for {symbol}"
                        )));
                    }

                    let chart: ChartResponse = resp.json().map_err(|e| {
                        ProviderError::Transient(format!("parse response for {symbol}: {e}"))
                    })?;

                    return Self::parse_response(symbol, chart);
                }
                Err(e) => {
                    if e.is_connect() || e.is_timeout() {
                        last_error = Some(ProviderError::Transient(e.to_string()));
                        continue;
                    }
                    return Err(ProviderError::Transient(e.to_string()));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::Transient("connection retries exhausted".into())))
    }
}

impl Default for ChartApiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for ChartApiProvider {
    fn name(&self) -> &'static str {
        "chart_api"
    }

    fn fetch_historical(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, ProviderError> {
        self.fetch_once(symbol, start, end)
    }

    fn rate_limit_delay(&self) -> Duration {
        self.rate_limit_delay
    }
}
