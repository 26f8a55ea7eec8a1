//! Symbol universe: the ordered list of instruments a run processes.
//!
//! Two sources: the sqlite `symbols` reference table (alphabetical), or a
//! TOML file of sector → tickers walked in sorted sector order. Both yield
//! a stable, deterministic ordering, which resumption depends on: the
//! checkpoint's `resume_from` is an index into this ordering.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("read universe file: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse universe TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Sector-organized universe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Universe {
    pub sectors: BTreeMap<String, Vec<String>>,
}

impl Universe {
    /// Load a universe from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, UniverseError> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_toml(&content)?)
    }

    /// Parse a universe from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// All tickers in deterministic order: sorted sector traversal, ticker
    /// order as listed, duplicates removed (first occurrence wins).
    pub fn ordered_symbols(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for tickers in self.sectors.values() {
            for ticker in tickers {
                if seen.insert(ticker.clone()) {
                    out.push(ticker.clone());
                }
            }
        }
        out
    }

    pub fn ticker_count(&self) -> usize {
        self.ordered_symbols().len()
    }
}

/// Restricts a universe while keeping its order stable.
#[derive(Debug, Clone, Default)]
pub struct UniverseFilter {
    /// Explicit allow-list; empty means all symbols.
    pub stocks: Vec<String>,
    /// Cap on universe size, applied after the allow-list.
    pub limit: Option<usize>,
}

impl UniverseFilter {
    pub fn apply(&self, symbols: Vec<String>) -> Vec<String> {
        let mut out: Vec<String> = if self.stocks.is_empty() {
            symbols
        } else {
            let allowed: BTreeSet<&String> = self.stocks.iter().collect();
            symbols.into_iter().filter(|s| allowed.contains(s)).collect()
        };
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}
