//! Serializable sync run configuration.
//!
//! TOML-deserializable with defaults for every field, so an empty file (or
//! none at all) yields a working incremental sync. `fingerprint()` hashes
//! the full config; the driver combines it with the start timestamp to form
//! run ids, so runs over identical settings group into one family.

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("days_back must be non-negative, got {0}")]
    InvalidDaysBack(i64),
}

/// Circuit breaker knobs, one set shared by all providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            half_open_max_calls: 3,
        }
    }
}

/// Backoff escalation knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub consecutive_failure_threshold: u32,
    pub max_delay_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            consecutive_failure_threshold: 5,
            max_delay_secs: 60,
        }
    }
}

/// Complete configuration for a sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Incremental window: sync the last N calendar days.
    pub days_back: i64,

    /// Historical backfill depth in years; overrides `days_back` when set.
    pub years: Option<u32>,

    /// Explicit allow-list restricting the universe (empty = all).
    pub stocks: Vec<String>,

    /// Cap on universe size.
    pub limit: Option<usize>,

    /// Attempts before a symbol is skipped permanently.
    pub max_retries: u32,

    /// Checkpoint flush cadence (symbols between durable writes).
    pub persist_every: usize,

    /// Fraction of theoretical trading days a result must cover.
    pub sufficiency_ratio: f64,

    /// Max close-to-close ratio before a bar is dropped as implausible.
    pub max_daily_move: f64,

    /// Provider priority order by name.
    pub providers: Vec<String>,

    pub breaker: BreakerConfig,
    pub backoff: BackoffConfig,

    /// Checkpoint state directory.
    pub state_dir: PathBuf,

    /// Sqlite database path.
    pub db_path: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            days_back: 7,
            years: None,
            stocks: Vec::new(),
            limit: None,
            max_retries: 3,
            persist_every: 25,
            sufficiency_ratio: 0.8,
            max_daily_move: 10.0,
            providers: vec!["chart_api".into(), "csv_api".into()],
            breaker: BreakerConfig::default(),
            backoff: BackoffConfig::default(),
            state_dir: PathBuf::from("state"),
            db_path: PathBuf::from("barsync.db"),
        }
    }
}

impl SyncConfig {
    /// Load from a TOML file; missing fields fall back to defaults.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Reject settings a run cannot execute. A negative `days_back` would
    /// invert the date range, so it fails here rather than mid-run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.days_back < 0 {
            return Err(ConfigError::InvalidDaysBack(self.days_back));
        }
        Ok(())
    }

    /// Inclusive date range this config asks for, ending at `today`.
    pub fn date_range(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let start = match self.years {
            Some(years) => today - Duration::days(i64::from(years) * 365),
            None => today - Duration::days(self.days_back),
        };
        (start, today)
    }

    /// Deterministic hash of this configuration.
    ///
    /// Two runs with identical settings share a fingerprint and therefore a
    /// run family; the driver appends the start timestamp for uniqueness.
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&json).to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: SyncConfig = toml::from_str("").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.days_back, 7);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.providers, vec!["chart_api", "csv_api"]);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config: SyncConfig = toml::from_str(
            r#"
days_back = 30
limit = 100

[breaker]
failure_threshold = 2
"#,
        )
        .unwrap();
        assert_eq!(config.days_back, 30);
        assert_eq!(config.limit, Some(100));
        assert_eq!(config.breaker.failure_threshold, 2);
        // Untouched nested field keeps its default.
        assert_eq!(config.breaker.recovery_timeout_secs, 60);
    }

    #[test]
    fn negative_days_back_is_rejected() {
        assert!(SyncConfig::default().validate().is_ok());

        let mut config = SyncConfig::default();
        config.days_back = -3;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDaysBack(-3))
        ));
    }

    #[test]
    fn years_overrides_days_back() {
        let mut config = SyncConfig::default();
        config.years = Some(2);
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let (start, end) = config.date_range(today);
        assert_eq!(end, today);
        assert!(today - start > Duration::days(700));
    }

    #[test]
    fn fingerprint_is_stable_and_config_sensitive() {
        let a = SyncConfig::default();
        let b = SyncConfig::default();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let mut c = SyncConfig::default();
        c.days_back = 30;
        assert_ne!(a.fingerprint(), c.fingerprint());
    }
}
