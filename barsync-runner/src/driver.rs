//! Sync driver: walks the symbol universe through the fallback engine.
//!
//! Per run: Init → LoadingUniverse → per-symbol Skip|Process → Finalizing →
//! Completed|Failed. Each symbol is either skipped (out of retries: no
//! network call, still advances the resume index) or resolved through the
//! orchestrator, validated, and upserted. Provider failures cost one symbol;
//! storage and checkpoint failures kill the run, because a run that cannot
//! record progress cannot safely resume.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use barsync_core::backoff::BackoffPolicy;
use barsync_core::orchestrator::FallbackOrchestrator;
use barsync_core::validate::validate_bars;
use chrono::NaiveDate;
use thiserror::Error;

use crate::checkpoint::{CheckpointError, CheckpointStore, RunStatus};
use crate::config::SyncConfig;
use crate::storage::{StorageError, StorageWriter};

/// Run-fatal driver errors. Per-symbol provider failures never surface
/// here; they are absorbed into the checkpoint's failure counts.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Summary of a finished (or terminated) run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub run_id: String,
    pub status: RunStatus,
    pub total_symbols: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped_permanent: u64,
    pub records_written: u64,
}

/// Drives one sync run over an ordered universe.
pub struct SyncDriver {
    orchestrator: FallbackOrchestrator,
    storage: Arc<dyn StorageWriter>,
    checkpoints: Arc<dyn CheckpointStore>,
    backoff: BackoffPolicy,
    max_retries: u32,
    persist_every: usize,
    max_daily_move: f64,
    cancel: Arc<AtomicBool>,
}

impl SyncDriver {
    pub fn new(
        orchestrator: FallbackOrchestrator,
        storage: Arc<dyn StorageWriter>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            orchestrator,
            storage,
            checkpoints,
            backoff: BackoffPolicy::new(
                config.backoff.consecutive_failure_threshold,
                Duration::from_secs(config.backoff.max_delay_secs),
            ),
            max_retries: config.max_retries,
            persist_every: config.persist_every.max(1),
            max_daily_move: config.max_daily_move,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag an external signal handler can set to stop the run
    /// after the in-flight symbol.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Consecutive whole-pipeline failures currently tracked by the
    /// backoff policy (for status reporting).
    pub fn consecutive_failures(&self) -> u32 {
        self.backoff.consecutive_failures()
    }

    /// Run a sync over the universe for the given inclusive date range.
    ///
    /// If the latest run checkpoint is still `Running` (a crash), it is
    /// resumed at its `resume_from`; otherwise a fresh run starts under
    /// `run_id`. Returns the final report; `Err` only for run-fatal
    /// storage/checkpoint failures (the run is marked Failed first).
    pub fn sync(
        &self,
        universe: &[String],
        start: NaiveDate,
        end: NaiveDate,
        run_id: &str,
    ) -> Result<SyncReport, DriverError> {
        let (run, resume_from) = match self.checkpoints.resume_latest()? {
            Some(run) => {
                log::info!(
                    "resuming run {} at symbol {}/{}",
                    run.run_id,
                    run.resume_from,
                    run.total_symbols
                );
                let resume_from = run.resume_from;
                (run, resume_from)
            }
            None => (self.checkpoints.start(run_id, universe.len())?, 0),
        };

        match self.process_universe(universe, start, end, resume_from) {
            Ok(()) => {
                self.checkpoints.flush()?;
                let run = self.checkpoints.complete()?;
                let report = self.report_for(&run.run_id);
                log::info!(
                    "run {} completed: {} ok, {} failed, {} skipped, {} records",
                    run.run_id,
                    report.succeeded,
                    report.failed,
                    report.skipped_permanent,
                    report.records_written
                );
                Ok(report)
            }
            Err(Terminated::Cancelled) => {
                self.checkpoints.flush()?;
                self.checkpoints.fail("cancelled")?;
                log::warn!("run {} cancelled", run.run_id);
                Ok(self.report_for(&run.run_id))
            }
            Err(Terminated::Fatal(err)) => {
                // Best effort: mark the run failed so it is not resumed
                // into the same broken storage.
                self.checkpoints.flush().ok();
                self.checkpoints.fail(&err.to_string()).ok();
                Err(err)
            }
        }
    }

    fn process_universe(
        &self,
        universe: &[String],
        start: NaiveDate,
        end: NaiveDate,
        resume_from: usize,
    ) -> Result<(), Terminated> {
        for (index, symbol) in universe.iter().enumerate().skip(resume_from) {
            if self.cancel.load(Ordering::SeqCst) {
                return Err(Terminated::Cancelled);
            }

            let failure_count = self
                .checkpoints
                .symbol_checkpoint(symbol)
                .map(|sc| sc.failure_count)
                .unwrap_or(0);

            if failure_count >= self.max_retries {
                log::debug!("{symbol}: permanently failed ({failure_count} failures), skipping");
                self.checkpoints.skip_symbol(symbol, index)?;
                self.checkpoints.update_metric("symbols_skipped_permanent", 1)?;
                // No network call was made; no sleep either.
                continue;
            }

            let base_delay = match self.process_symbol(symbol, start, end, index)? {
                Some(source) => self.orchestrator.delay_for_source(source),
                None => self.orchestrator.primary_delay(),
            };

            if (index + 1) % self.persist_every == 0 {
                self.checkpoints.flush()?;
            }

            if index + 1 < universe.len() {
                std::thread::sleep(self.backoff.delay_for(base_delay));
            }
        }
        Ok(())
    }

    /// Process one symbol end to end. Returns the serving provider's name
    /// on success, `None` on a per-symbol failure.
    fn process_symbol(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        index: usize,
    ) -> Result<Option<&'static str>, Terminated> {
        let outcome = self
            .orchestrator
            .resolve(symbol, start, end)
            .and_then(|fetch| {
                let bars = validate_bars(symbol, fetch.bars, self.max_daily_move)?;
                Ok((bars, fetch.source))
            });

        match outcome {
            Ok((bars, source)) => {
                let written = self
                    .storage
                    .upsert_bars(symbol, &bars, source)
                    .map_err(|e| Terminated::Fatal(e.into()))?;

                self.checkpoints.update_symbol(symbol, true, index)?;
                self.checkpoints.update_metric("symbols_succeeded", 1)?;
                self.checkpoints
                    .update_metric("records_updated", written as u64)?;
                self.backoff.record_success();
                Ok(Some(source))
            }
            Err(err) => {
                log::warn!("{symbol}: sync failed: {err}");
                self.checkpoints.update_symbol(symbol, false, index)?;
                self.checkpoints.update_metric("symbols_failed", 1)?;
                self.backoff.record_failure();
                Ok(None)
            }
        }
    }

    fn report_for(&self, run_id: &str) -> SyncReport {
        let run = self.checkpoints.current_run();
        let metrics = run.as_ref().map(|r| r.metrics.clone()).unwrap_or_default();
        let metric = |name: &str| metrics.get(name).copied().unwrap_or(0);
        SyncReport {
            run_id: run_id.to_string(),
            status: run.map(|r| r.status).unwrap_or(RunStatus::Failed),
            total_symbols: self
                .checkpoints
                .current_run()
                .map(|r| r.total_symbols)
                .unwrap_or(0),
            succeeded: metric("symbols_succeeded"),
            failed: metric("symbols_failed"),
            skipped_permanent: metric("symbols_skipped_permanent"),
            records_written: metric("records_updated"),
        }
    }
}

/// Internal loop termination reasons.
enum Terminated {
    Cancelled,
    Fatal(DriverError),
}

impl From<CheckpointError> for Terminated {
    fn from(err: CheckpointError) -> Self {
        Terminated::Fatal(err.into())
    }
}
