//! Storage writer: idempotent bar upserts into sqlite.
//!
//! The `daily_prices` table is keyed `(symbol, date)`; re-applying the same
//! bar updates the row in place, so a re-run after a crash writes no
//! duplicates. The same database carries the `symbols` reference table the
//! universe is read from.

use barsync_core::domain::Bar;
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

/// Storage failures are run-fatal in the driver.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Idempotent upsert sink for validated bars.
pub trait StorageWriter: Send + Sync {
    /// Upsert bars for one symbol; returns the number of rows written.
    fn upsert_bars(&self, symbol: &str, bars: &[Bar], source: &str)
        -> Result<usize, StorageError>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS daily_prices (
    symbol     TEXT NOT NULL,
    date       TEXT NOT NULL,
    open       REAL NOT NULL,
    high       REAL NOT NULL,
    low        REAL NOT NULL,
    close      REAL NOT NULL,
    adj_close  REAL NOT NULL,
    volume     INTEGER NOT NULL,
    source     TEXT NOT NULL,
    PRIMARY KEY (symbol, date)
);

CREATE TABLE IF NOT EXISTS symbols (
    symbol  TEXT PRIMARY KEY,
    name    TEXT,
    active  INTEGER NOT NULL DEFAULT 1
);
"#;

/// Sqlite-backed bar store.
pub struct SqliteBarStore {
    conn: Mutex<Connection>,
}

impl SqliteBarStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Active symbols in deterministic (alphabetical) order.
    pub fn active_symbols(&self) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT symbol FROM symbols WHERE active = 1 ORDER BY symbol")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Seed or refresh the symbols reference table.
    pub fn upsert_symbols(&self, symbols: &[String]) -> Result<usize, StorageError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO symbols (symbol, active) VALUES (?1, 1)
                 ON CONFLICT(symbol) DO UPDATE SET active = 1",
            )?;
            for symbol in symbols {
                stmt.execute(params![symbol])?;
                count += 1;
            }
        }
        tx.commit()?;
        Ok(count)
    }

    /// Number of stored bars for a symbol.
    pub fn bar_count(&self, symbol: &str) -> Result<usize, StorageError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM daily_prices WHERE symbol = ?1",
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// One stored bar, if present.
    pub fn get_bar(&self, symbol: &str, date: NaiveDate) -> Result<Option<Bar>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT open, high, low, close, adj_close, volume
             FROM daily_prices WHERE symbol = ?1 AND date = ?2",
        )?;
        let mut rows = stmt.query_map(params![symbol, date.to_string()], |row| {
            Ok(Bar {
                symbol: symbol.to_string(),
                date,
                open: row.get(0)?,
                high: row.get(1)?,
                low: row.get(2)?,
                close: row.get(3)?,
                adj_close: row.get(4)?,
                volume: row.get::<_, i64>(5)? as u64,
            })
        })?;
        match rows.next() {
            Some(bar) => Ok(Some(bar?)),
            None => Ok(None),
        }
    }
}

impl StorageWriter for SqliteBarStore {
    fn upsert_bars(
        &self,
        symbol: &str,
        bars: &[Bar],
        source: &str,
    ) -> Result<usize, StorageError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut count = 0;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO daily_prices
                (symbol, date, open, high, low, close, adj_close, volume, source)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(symbol, date) DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    adj_close = excluded.adj_close,
                    volume = excluded.volume,
                    source = excluded.source
                "#,
            )?;
            for bar in bars {
                stmt.execute(params![
                    symbol,
                    bar.date.to_string(),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.adj_close,
                    bar.volume as i64,
                    source,
                ])?;
                count += 1;
            }
        }
        tx.commit()?;
        Ok(count)
    }
}

/// In-memory store for tests: the same `(symbol, date)` keying as sqlite,
/// plus an optional scripted failure for exercising the run-fatal path.
#[derive(Default)]
pub struct MemoryBarStore {
    rows: Mutex<BTreeMap<(String, NaiveDate), Bar>>,
    sources: Mutex<BTreeMap<String, String>>,
    fail_writes: Mutex<bool>,
}

impl MemoryBarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (run-fatal scenario).
    pub fn fail_writes(&self) {
        *self.fail_writes.lock().unwrap() = true;
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn get(&self, symbol: &str, date: NaiveDate) -> Option<Bar> {
        self.rows
            .lock()
            .unwrap()
            .get(&(symbol.to_string(), date))
            .cloned()
    }

    /// Which provider last served a symbol's bars.
    pub fn source_for(&self, symbol: &str) -> Option<String> {
        self.sources.lock().unwrap().get(symbol).cloned()
    }

    pub fn symbols_written(&self) -> Vec<String> {
        let rows = self.rows.lock().unwrap();
        let mut symbols: Vec<String> = rows.keys().map(|(s, _)| s.clone()).collect();
        symbols.dedup();
        symbols
    }
}

impl StorageWriter for MemoryBarStore {
    fn upsert_bars(
        &self,
        symbol: &str,
        bars: &[Bar],
        source: &str,
    ) -> Result<usize, StorageError> {
        if *self.fail_writes.lock().unwrap() {
            return Err(StorageError::Sqlite(rusqlite::Error::InvalidQuery));
        }
        let mut rows = self.rows.lock().unwrap();
        for bar in bars {
            rows.insert((symbol.to_string(), bar.date), bar.clone());
        }
        self.sources
            .lock()
            .unwrap()
            .insert(symbol.to_string(), source.to_string());
        Ok(bars.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(symbol: &str, day: u32, close: f64) -> Bar {
        Bar {
            symbol: symbol.into(),
            date: NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            adj_close: close,
            volume: 10_000,
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let store = SqliteBarStore::open_in_memory().unwrap();
        let bars = vec![bar("SPY", 4, 100.0), bar("SPY", 5, 101.0)];

        assert_eq!(store.upsert_bars("SPY", &bars, "chart_api").unwrap(), 2);
        assert_eq!(store.upsert_bars("SPY", &bars, "chart_api").unwrap(), 2);
        assert_eq!(store.bar_count("SPY").unwrap(), 2);
    }

    #[test]
    fn reapplying_updates_in_place() {
        let store = SqliteBarStore::open_in_memory().unwrap();
        store
            .upsert_bars("SPY", &[bar("SPY", 4, 100.0)], "chart_api")
            .unwrap();
        // Correction: same key, new close.
        store
            .upsert_bars("SPY", &[bar("SPY", 4, 99.5)], "csv_api")
            .unwrap();

        assert_eq!(store.bar_count("SPY").unwrap(), 1);
        let stored = store
            .get_bar("SPY", NaiveDate::from_ymd_opt(2024, 3, 4).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(stored.close, 99.5);
    }

    #[test]
    fn symbols_table_round_trip() {
        let store = SqliteBarStore::open_in_memory().unwrap();
        store
            .upsert_symbols(&["BBB".into(), "AAA".into(), "CCC".into()])
            .unwrap();
        // Deterministic alphabetical order regardless of insert order.
        assert_eq!(store.active_symbols().unwrap(), vec!["AAA", "BBB", "CCC"]);
        // Upserting again does not duplicate.
        store.upsert_symbols(&["AAA".into()]).unwrap();
        assert_eq!(store.active_symbols().unwrap().len(), 3);
    }

    #[test]
    fn memory_store_matches_sqlite_keying() {
        let store = MemoryBarStore::new();
        store
            .upsert_bars("SPY", &[bar("SPY", 4, 100.0)], "chart_api")
            .unwrap();
        store
            .upsert_bars("SPY", &[bar("SPY", 4, 99.5)], "chart_api")
            .unwrap();
        assert_eq!(store.row_count(), 1);
        assert_eq!(
            store
                .get("SPY", NaiveDate::from_ymd_opt(2024, 3, 4).unwrap())
                .unwrap()
                .close,
            99.5
        );
    }
}
