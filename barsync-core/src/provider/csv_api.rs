//! Secondary provider: CSV-over-HTTP daily history (Stooq-style endpoint).
//!
//! Serves `Date,Open,High,Low,Close,Volume` rows for one symbol per request.
//! More lenient rate limits than the chart API, so it carries a sub-second
//! delay and a real batch path: `fetch_batch` walks up to `batch_size`
//! symbols back to back, sharing one delay budget between requests.

use crate::domain::Bar;
use crate::provider::{Provider, ProviderError};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://stooq.com/q/d/l";

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(rename = "Date")]
    date: NaiveDate,
    #[serde(rename = "Open")]
    open: f64,
    #[serde(rename = "High")]
    high: f64,
    #[serde(rename = "Low")]
    low: f64,
    #[serde(rename = "Close")]
    close: f64,
    #[serde(rename = "Volume")]
    volume: Option<u64>,
}

/// CSV-over-HTTP history provider.
pub struct CsvApiProvider {
    client: reqwest::blocking::Client,
    base_url: String,
    rate_limit_delay: Duration,
    batch_size: usize,
}

impl CsvApiProvider {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Point the provider at a different endpoint (test servers).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            base_url: base_url.into(),
            rate_limit_delay: Duration::from_millis(400),
            batch_size: 10,
        }
    }

    fn history_url(&self, symbol: &str, start: NaiveDate, end: NaiveDate) -> String {
        format!(
            "{}/?s={}&d1={}&d2={}&i=d",
            self.base_url,
            symbol.to_lowercase(),
            start.format("%Y%m%d"),
            end.format("%Y%m%d"),
        )
    }

    /// Parse a CSV body into bars. The endpoint signals an unknown symbol
    /// with a plain-text "No data" body instead of an error status.
    fn parse_csv(symbol: &str, body: &str) -> Result<Vec<Bar>, ProviderError> {
        let trimmed = body.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("no data") {
            return Err(ProviderError::NotFound {
                symbol: symbol.to_string(),
            });
        }

        let mut reader = csv::Reader::from_reader(trimmed.as_bytes());
        let mut bars = Vec::new();
        for row in reader.deserialize::<CsvRow>() {
            let row = row
                .map_err(|e| ProviderError::Transient(format!("parse CSV for {symbol}: {e}")))?;
            bars.push(Bar {
                symbol: symbol.to_string(),
                date: row.date,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                // No adjusted series on this endpoint; close stands in.
                adj_close: row.close,
                volume: row.volume.unwrap_or(0),
            });
        }

        if bars.is_empty() {
            return Err(ProviderError::NoData {
                symbol: symbol.to_string(),
            });
        }

        Ok(bars)
    }
}

impl Default for CsvApiProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for CsvApiProvider {
    fn name(&self) -> &'static str {
        "csv_api"
    }

    fn fetch_historical(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<Bar>, ProviderError> {
        let url = self.history_url(symbol, start, end);

        let resp = self.client.get(&url).send().map_err(|e| {
            ProviderError::Transient(format!("request for {symbol}: {e}"))
        })?;

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited {
                retry_after_secs: 60,
            });
        }
        if !status.is_success() {
            return Err(ProviderError::Transient(format!(
                "HTTP {status} for {symbol}"
            )));
        }

        let body = resp
            .text()
            .map_err(|e| ProviderError::Transient(format!("read body for {symbol}: {e}")))?;

        Self::parse_csv(symbol, &body)
    }

    fn fetch_batch(
        &self,
        symbols: &[&str],
        start: NaiveDate,
        end: NaiveDate,
    ) -> HashMap<String, Vec<Bar>> {
        let mut out = HashMap::new();
        for (i, symbol) in symbols.iter().take(self.batch_size).enumerate() {
            if i > 0 {
                std::thread::sleep(self.rate_limit_delay);
            }
            match self.fetch_historical(symbol, start, end) {
                Ok(bars) => {
                    out.insert(symbol.to_string(), bars);
                }
                Err(e) => log::debug!("batch fetch {symbol}: {e}"),
            }
        }
        out
    }

    fn rate_limit_delay(&self) -> Duration {
        self.rate_limit_delay
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}
