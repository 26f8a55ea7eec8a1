//! Bar series validation: sort, dedupe, sanity-check.
//!
//! Providers return whatever their upstream serves; before anything reaches
//! storage the series is sorted chronologically, duplicate dates are dropped
//! (keep first), and each bar is checked for sane OHLC plus an implausible
//! close-to-close move against its predecessor. A series that loses too many
//! bars to the checks is rejected outright as `ValidationFailed`: a feed
//! that mangled half its rows is not worth upserting.

use crate::domain::Bar;
use crate::provider::ProviderError;

/// Maximum close-to-close ratio between consecutive bars before the later
/// bar counts as implausible (splits are adjusted upstream).
pub const DEFAULT_MAX_DAILY_MOVE: f64 = 10.0;

/// Minimum fraction of the input that must survive the checks.
const MIN_SURVIVING_FRACTION: f64 = 0.5;

/// Sort, dedupe, and sanity-check a fetched series.
///
/// Returns the cleaned bars, or `ValidationFailed` if the input was empty
/// after cleaning or more than half of it was dropped.
pub fn validate_bars(
    symbol: &str,
    mut bars: Vec<Bar>,
    max_daily_move: f64,
) -> Result<Vec<Bar>, ProviderError> {
    if bars.is_empty() {
        return Err(ProviderError::ValidationFailed(format!(
            "{symbol}: empty series"
        )));
    }
    let input_len = bars.len();

    bars.sort_by_key(|b| b.date);
    bars.dedup_by_key(|b| b.date);

    let mut cleaned: Vec<Bar> = Vec::with_capacity(bars.len());
    for bar in bars {
        if !bar.is_sane() {
            log::debug!("{symbol}: dropping insane bar on {}", bar.date);
            continue;
        }
        if let Some(prev) = cleaned.last() {
            let ratio = if bar.close > prev.close {
                bar.close / prev.close
            } else {
                prev.close / bar.close
            };
            if ratio > max_daily_move {
                log::debug!(
                    "{symbol}: dropping implausible move on {} ({} -> {})",
                    bar.date,
                    prev.close,
                    bar.close
                );
                continue;
            }
        }
        cleaned.push(bar);
    }

    if cleaned.is_empty() {
        return Err(ProviderError::ValidationFailed(format!(
            "{symbol}: no bars survived validation"
        )));
    }
    if (cleaned.len() as f64) < (input_len as f64) * MIN_SURVIVING_FRACTION {
        return Err(ProviderError::ValidationFailed(format!(
            "{symbol}: only {}/{input_len} bars survived validation",
            cleaned.len()
        )));
    }

    Ok(cleaned)
}
