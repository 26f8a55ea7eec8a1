//! End-to-end sync driver scenarios against scripted providers.
//!
//! Covers the engine's coordination guarantees: fallback sourcing, exact
//! suffix resumption after a crash, permanent skip of repeatedly-broken
//! symbols with zero provider calls, run-fatal storage failures, and clean
//! cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use barsync_core::breaker::CircuitBreaker;
use barsync_core::domain::Bar;
use barsync_core::orchestrator::{FallbackOrchestrator, GuardedProvider};
use barsync_core::provider::{Provider, ProviderError};
use barsync_runner::checkpoint::{CheckpointStore, JsonCheckpointStore, RunStatus};
use barsync_runner::config::SyncConfig;
use barsync_runner::driver::SyncDriver;
use barsync_runner::storage::MemoryBarStore;
use chrono::{Datelike, NaiveDate, Weekday};
use tempfile::TempDir;

// ── Fixtures ─────────────────────────────────────────────────────────

/// Provider whose per-symbol outcomes are scripted per call. Exhausted
/// scripts answer NotFound. Counts every fetch.
struct ScriptedProvider {
    name: &'static str,
    outcomes: Mutex<HashMap<String, Vec<Result<Vec<Bar>, ProviderError>>>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            outcomes: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        })
    }

    fn script(&self, symbol: &str, outcome: Result<Vec<Bar>, ProviderError>) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(symbol.to_string())
            .or_default()
            .push(outcome);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Provider for ScriptedProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn fetch_historical(
        &self,
        symbol: &str,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<Vec<Bar>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut outcomes = self.outcomes.lock().unwrap();
        match outcomes.get_mut(symbol) {
            Some(v) if !v.is_empty() => v.remove(0),
            _ => Err(ProviderError::NotFound {
                symbol: symbol.to_string(),
            }),
        }
    }

    fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(1)
    }
}

fn good_bars(symbol: &str, count: usize) -> Vec<Bar> {
    let mut out = Vec::new();
    let mut date = start_date();
    while out.len() < count {
        if !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            out.push(Bar {
                symbol: symbol.into(),
                date,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                adj_close: 100.5,
                volume: 1_000,
            });
        }
        date = date.succ_opt().unwrap();
    }
    out
}

fn bad_bars(symbol: &str, count: usize) -> Vec<Bar> {
    let mut bars = good_bars(symbol, count);
    for bar in &mut bars {
        bar.high = 0.0; // inverted OHLC, fails validation
    }
    bars
}

fn start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
}

fn end_date() -> NaiveDate {
    // Two full weeks: 10 weekdays, sufficiency bar of 8 at ratio 0.8.
    NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
}

fn test_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.backoff.max_delay_secs = 1;
    config
}

struct Harness {
    primary: Arc<ScriptedProvider>,
    secondary: Arc<ScriptedProvider>,
    storage: Arc<MemoryBarStore>,
    checkpoints: Arc<JsonCheckpointStore>,
    _state_dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        let state_dir = TempDir::new().unwrap();
        Self {
            primary: ScriptedProvider::new("primary"),
            secondary: ScriptedProvider::new("secondary"),
            storage: Arc::new(MemoryBarStore::new()),
            checkpoints: Arc::new(JsonCheckpointStore::open(state_dir.path()).unwrap()),
            _state_dir: state_dir,
        }
    }

    fn driver(&self) -> SyncDriver {
        let config = test_config();
        let orchestrator = FallbackOrchestrator::new(
            vec![
                GuardedProvider::new(
                    self.primary.clone(),
                    CircuitBreaker::default_provider("primary"),
                ),
                GuardedProvider::new(
                    self.secondary.clone(),
                    CircuitBreaker::default_provider("secondary"),
                ),
            ],
            config.sufficiency_ratio,
        );
        SyncDriver::new(
            orchestrator,
            self.storage.clone(),
            self.checkpoints.clone(),
            &config,
        )
    }
}

fn universe(symbols: &[&str]) -> Vec<String> {
    symbols.iter().map(|s| s.to_string()).collect()
}

// ── Scenarios ────────────────────────────────────────────────────────

#[test]
fn fallback_serves_failed_primary_symbol_from_secondary() {
    let h = Harness::new();
    h.primary
        .script("AAA", Err(ProviderError::Transient("reset".into())));
    h.primary.script("BBB", Ok(good_bars("BBB", 10)));
    h.primary.script("CCC", Ok(good_bars("CCC", 10)));
    h.secondary.script("AAA", Ok(good_bars("AAA", 10)));

    let report = h
        .driver()
        .sync(&universe(&["AAA", "BBB", "CCC"]), start_date(), end_date(), "run1")
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.skipped_permanent, 0);
    assert_eq!(report.records_written, 30);

    assert_eq!(h.storage.source_for("AAA").unwrap(), "secondary");
    assert_eq!(h.storage.source_for("BBB").unwrap(), "primary");

    let run = h.checkpoints.current_run().unwrap();
    assert_eq!(run.resume_from, 3);
}

#[test]
fn permanently_failed_symbol_is_skipped_without_provider_calls() {
    let h = Harness::new();

    // Three runs of both providers failing: failure_count reaches 3.
    for i in 0..3 {
        h.primary
            .script("XYZ", Err(ProviderError::Transient("down".into())));
        h.secondary
            .script("XYZ", Err(ProviderError::Transient("down".into())));
        let report = h
            .driver()
            .sync(&universe(&["XYZ"]), start_date(), end_date(), &format!("run{i}"))
            .unwrap();
        assert_eq!(report.failed, 1);
    }
    assert_eq!(
        h.checkpoints.symbol_checkpoint("XYZ").unwrap().failure_count,
        3
    );

    // Fourth run: zero provider calls, still processed and advanced.
    let calls_before = (h.primary.calls(), h.secondary.calls());
    let report = h
        .driver()
        .sync(&universe(&["XYZ"]), start_date(), end_date(), "run4")
        .unwrap();

    assert_eq!((h.primary.calls(), h.secondary.calls()), calls_before);
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.skipped_permanent, 1);
    assert_eq!(report.succeeded, 0);

    let sc = h.checkpoints.symbol_checkpoint("XYZ").unwrap();
    assert!(sc.processed);
    assert!(!sc.succeeded);
    assert_eq!(sc.failure_count, 3);
    assert_eq!(h.checkpoints.current_run().unwrap().resume_from, 1);
}

#[test]
fn success_clears_accumulated_failure_count() {
    let h = Harness::new();
    h.primary
        .script("AAA", Err(ProviderError::Transient("down".into())));
    h.driver()
        .sync(&universe(&["AAA"]), start_date(), end_date(), "run1")
        .unwrap();
    assert_eq!(
        h.checkpoints.symbol_checkpoint("AAA").unwrap().failure_count,
        1
    );

    h.primary.script("AAA", Ok(good_bars("AAA", 10)));
    let report = h
        .driver()
        .sync(&universe(&["AAA"]), start_date(), end_date(), "run2")
        .unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(
        h.checkpoints.symbol_checkpoint("AAA").unwrap().failure_count,
        0
    );
}

#[test]
fn crashed_run_resumes_exactly_at_the_suffix() {
    let state_dir = TempDir::new().unwrap();

    // Simulate a crash after two symbols were durably recorded.
    {
        let store = JsonCheckpointStore::open(state_dir.path()).unwrap();
        store.start("run1", 3).unwrap();
        store.update_symbol("AAA", true, 0).unwrap();
        store.update_symbol("BBB", true, 1).unwrap();
        store.update_metric("symbols_succeeded", 2).unwrap();
        store.flush().unwrap();
    }

    let primary = ScriptedProvider::new("primary");
    let secondary = ScriptedProvider::new("secondary");
    // Only CCC is scripted: any call for AAA/BBB would burn a call count.
    primary.script("CCC", Ok(good_bars("CCC", 10)));

    let storage = Arc::new(MemoryBarStore::new());
    let checkpoints = Arc::new(JsonCheckpointStore::open(state_dir.path()).unwrap());
    let config = test_config();
    let orchestrator = FallbackOrchestrator::new(
        vec![
            GuardedProvider::new(primary.clone(), CircuitBreaker::default_provider("primary")),
            GuardedProvider::new(
                secondary.clone(),
                CircuitBreaker::default_provider("secondary"),
            ),
        ],
        config.sufficiency_ratio,
    );
    let driver = SyncDriver::new(orchestrator, storage.clone(), checkpoints.clone(), &config);

    let report = driver
        .sync(
            &universe(&["AAA", "BBB", "CCC"]),
            start_date(),
            end_date(),
            "ignored-when-resuming",
        )
        .unwrap();

    // Exactly one provider call: CCC. Indices 0 and 1 were never re-fetched.
    assert_eq!(primary.calls(), 1);
    assert_eq!(secondary.calls(), 0);
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.run_id, "run1");
    assert_eq!(storage.symbols_written(), vec!["CCC"]);
    assert_eq!(checkpoints.current_run().unwrap().resume_from, 3);
}

#[test]
fn storage_failure_is_run_fatal() {
    let h = Harness::new();
    h.primary.script("AAA", Ok(good_bars("AAA", 10)));
    h.storage.fail_writes();

    let result = h
        .driver()
        .sync(&universe(&["AAA", "BBB"]), start_date(), end_date(), "run1");

    assert!(result.is_err());
    let run = h.checkpoints.current_run().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error_message.is_some());
}

#[test]
fn validation_failure_costs_one_symbol_not_the_run() {
    let h = Harness::new();
    h.primary.script("BAD", Ok(bad_bars("BAD", 10)));
    h.primary.script("GOOD", Ok(good_bars("GOOD", 10)));

    let report = h
        .driver()
        .sync(&universe(&["BAD", "GOOD"]), start_date(), end_date(), "run1")
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(h.storage.symbols_written(), vec!["GOOD"]);
}

#[test]
fn cancellation_finalizes_instead_of_leaving_running() {
    let h = Harness::new();
    let driver = h.driver();
    driver.cancel_flag().store(true, Ordering::SeqCst);

    let report = driver
        .sync(&universe(&["AAA", "BBB"]), start_date(), end_date(), "run1")
        .unwrap();

    assert_eq!(h.primary.calls(), 0);
    assert_eq!(report.status, RunStatus::Failed);
    let run = h.checkpoints.current_run().unwrap();
    assert_eq!(run.error_message.as_deref(), Some("cancelled"));
}

#[test]
fn insufficient_primary_result_falls_back_and_keeps_best() {
    let h = Harness::new();
    h.primary.script("AAA", Ok(good_bars("AAA", 3)));
    h.secondary.script("AAA", Ok(good_bars("AAA", 6))); // larger but still short

    let report = h
        .driver()
        .sync(&universe(&["AAA"]), start_date(), end_date(), "run1")
        .unwrap();

    // Best partial result accepted rather than discarding the symbol.
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.records_written, 6);
    assert_eq!(h.storage.source_for("AAA").unwrap(), "secondary");
}

#[test]
fn pipeline_failures_escalate_backoff_until_a_success() {
    let h = Harness::new();
    let driver = h.driver();

    for i in 0..4 {
        h.primary.script(
            &format!("F{i}"),
            Err(ProviderError::Transient("down".into())),
        );
        h.secondary.script(
            &format!("F{i}"),
            Err(ProviderError::Transient("down".into())),
        );
    }
    h.primary.script("OK", Ok(good_bars("OK", 10)));

    let report = driver
        .sync(
            &universe(&["F0", "F1", "F2", "F3", "OK"]),
            start_date(),
            end_date(),
            "run1",
        )
        .unwrap();

    assert_eq!(report.failed, 4);
    assert_eq!(report.succeeded, 1);
    // The trailing success reset the whole-pipeline failure streak.
    assert_eq!(driver.consecutive_failures(), 0);
}
