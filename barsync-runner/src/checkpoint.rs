//! Durable run and per-symbol checkpoints.
//!
//! One JSON document per run in the state directory, written atomically
//! (tmp + rename). The document carries the run-level record (status,
//! resume index, additive metric counters) and the per-symbol map that
//! remembers failure counts across runs: the memory that stops the engine
//! from retrying permanently-broken symbols forever.
//!
//! A crashed run leaves its document in `Running` status; the next
//! invocation resumes it at `resume_from` with the same symbol map and
//! re-processes nothing before that index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Terminal and non-terminal run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    /// Cancelled cleanly after some symbols succeeded.
    Partial,
}

/// Per-symbol outcome record within a run family.
///
/// Created on first attempt, updated on every attempt, never deleted
/// implicitly. `failure_count` survives across runs; a success clears it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolCheckpoint {
    pub symbol: String,
    pub processed: bool,
    pub succeeded: bool,
    pub failure_count: u32,
    pub last_attempt_index: usize,
}

/// Run-level checkpoint record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_symbols: usize,
    /// Index of the next symbol to process. Monotone non-decreasing.
    pub resume_from: usize,
    /// Additive counters (records_updated, symbols_succeeded, ...).
    pub metrics: BTreeMap<String, u64>,
    pub error_message: Option<String>,
}

/// Checkpoint failures are run-fatal: if progress cannot be recorded, the
/// run cannot safely resume and must terminate.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("no active run")]
    NoActiveRun,

    #[error("run {0} is already finalized")]
    AlreadyFinalized(String),
}

/// Write path for run and symbol outcomes.
///
/// `update_symbol` is the single write path for attempt outcomes and also
/// advances `resume_from` to `index + 1`; `skip_symbol` records a
/// permanently-failed symbol as processed without touching its failure
/// count. `complete`/`fail` are terminal and flush durably.
pub trait CheckpointStore: Send + Sync {
    fn start(&self, run_id: &str, total_symbols: usize) -> Result<RunCheckpoint, CheckpointError>;

    /// Install the latest non-finalized run as current, if any.
    fn resume_latest(&self) -> Result<Option<RunCheckpoint>, CheckpointError>;

    fn update_symbol(
        &self,
        symbol: &str,
        succeeded: bool,
        index: usize,
    ) -> Result<(), CheckpointError>;

    fn skip_symbol(&self, symbol: &str, index: usize) -> Result<(), CheckpointError>;

    fn update_metric(&self, name: &str, delta: u64) -> Result<(), CheckpointError>;

    fn symbol_checkpoint(&self, symbol: &str) -> Option<SymbolCheckpoint>;

    fn current_run(&self) -> Option<RunCheckpoint>;

    fn complete(&self) -> Result<RunCheckpoint, CheckpointError>;

    fn fail(&self, reason: &str) -> Result<RunCheckpoint, CheckpointError>;

    /// Persist the in-memory state durably.
    fn flush(&self) -> Result<(), CheckpointError>;

    /// Clear one symbol's record (external reset of a permanent failure).
    fn reset_symbol(&self, symbol: &str) -> Result<(), CheckpointError>;
}

/// On-disk document: run record plus the per-symbol map.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunDocument {
    run: RunCheckpoint,
    symbols: BTreeMap<String, SymbolCheckpoint>,
}

/// JSON-file checkpoint store, one document per run.
pub struct JsonCheckpointStore {
    state_dir: PathBuf,
    current: Mutex<Option<(PathBuf, RunDocument)>>,
}

impl JsonCheckpointStore {
    /// Open (and create if needed) a state directory.
    pub fn open(state_dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir)?;
        Ok(Self {
            state_dir,
            current: Mutex::new(None),
        })
    }

    /// Run documents sorted newest-first by file name (sortable timestamp
    /// prefix). Malformed documents are skipped, not fatal.
    fn run_files_newest_first(&self) -> Result<Vec<PathBuf>, CheckpointError> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.state_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| {
                p.extension().is_some_and(|ext| ext == "json")
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("run-"))
            })
            .collect();
        files.sort();
        files.reverse();
        Ok(files)
    }

    fn load_document(path: &Path) -> Option<RunDocument> {
        let content = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(doc) => Some(doc),
            Err(e) => {
                log::warn!("skipping malformed checkpoint {}: {e}", path.display());
                None
            }
        }
    }

    /// Newest run document on disk, regardless of status.
    pub fn latest_run(
        &self,
    ) -> Result<Option<(RunCheckpoint, BTreeMap<String, SymbolCheckpoint>)>, CheckpointError> {
        for path in self.run_files_newest_first()? {
            if let Some(doc) = Self::load_document(&path) {
                return Ok(Some((doc.run, doc.symbols)));
            }
        }
        Ok(None)
    }

    /// Atomic write: serialize to a .tmp sibling, then rename into place.
    fn write_document(path: &Path, doc: &RunDocument) -> Result<(), CheckpointError> {
        let json = serde_json::to_string_pretty(doc)?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            CheckpointError::Io(e)
        })?;
        Ok(())
    }

    fn finalize(
        &self,
        status: RunStatus,
        error_message: Option<String>,
    ) -> Result<RunCheckpoint, CheckpointError> {
        let mut guard = self.current.lock().unwrap();
        let (path, doc) = guard.as_mut().ok_or(CheckpointError::NoActiveRun)?;
        if doc.run.status != RunStatus::Running {
            return Err(CheckpointError::AlreadyFinalized(doc.run.run_id.clone()));
        }
        doc.run.status = status;
        doc.run.completed_at = Some(Utc::now());
        doc.run.error_message = error_message;
        Self::write_document(path, doc)?;
        Ok(doc.run.clone())
    }
}

impl CheckpointStore for JsonCheckpointStore {
    fn start(&self, run_id: &str, total_symbols: usize) -> Result<RunCheckpoint, CheckpointError> {
        // Carry failure counts forward from the newest previous run; the
        // per-run flags start fresh.
        let mut symbols = self
            .latest_run()?
            .map(|(_, symbols)| symbols)
            .unwrap_or_default();
        for sc in symbols.values_mut() {
            sc.processed = false;
            sc.succeeded = false;
        }

        let started_at = Utc::now();
        let run = RunCheckpoint {
            run_id: run_id.to_string(),
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            total_symbols,
            resume_from: 0,
            metrics: BTreeMap::new(),
            error_message: None,
        };

        let file_name = format!(
            "run-{}-{run_id}.json",
            started_at.format("%Y%m%dT%H%M%S%3f")
        );
        let path = self.state_dir.join(file_name);
        let doc = RunDocument {
            run: run.clone(),
            symbols,
        };
        Self::write_document(&path, &doc)?;
        *self.current.lock().unwrap() = Some((path, doc));
        Ok(run)
    }

    fn resume_latest(&self) -> Result<Option<RunCheckpoint>, CheckpointError> {
        for path in self.run_files_newest_first()? {
            if let Some(doc) = Self::load_document(&path) {
                if doc.run.status == RunStatus::Running {
                    let run = doc.run.clone();
                    *self.current.lock().unwrap() = Some((path, doc));
                    return Ok(Some(run));
                }
                // Newest run is finalized; nothing to resume.
                return Ok(None);
            }
        }
        Ok(None)
    }

    fn update_symbol(
        &self,
        symbol: &str,
        succeeded: bool,
        index: usize,
    ) -> Result<(), CheckpointError> {
        let mut guard = self.current.lock().unwrap();
        let (_, doc) = guard.as_mut().ok_or(CheckpointError::NoActiveRun)?;

        let sc = doc
            .symbols
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolCheckpoint {
                symbol: symbol.to_string(),
                processed: false,
                succeeded: false,
                failure_count: 0,
                last_attempt_index: index,
            });
        sc.processed = true;
        sc.succeeded = succeeded;
        sc.last_attempt_index = index;
        if succeeded {
            sc.failure_count = 0;
        } else {
            sc.failure_count += 1;
        }

        doc.run.resume_from = doc.run.resume_from.max(index + 1);
        Ok(())
    }

    fn skip_symbol(&self, symbol: &str, index: usize) -> Result<(), CheckpointError> {
        let mut guard = self.current.lock().unwrap();
        let (_, doc) = guard.as_mut().ok_or(CheckpointError::NoActiveRun)?;

        let sc = doc
            .symbols
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolCheckpoint {
                symbol: symbol.to_string(),
                processed: false,
                succeeded: false,
                failure_count: 0,
                last_attempt_index: index,
            });
        sc.processed = true;
        sc.succeeded = false;
        sc.last_attempt_index = index;
        // failure_count deliberately untouched: the skip is a consequence
        // of past failures, not a new attempt.

        doc.run.resume_from = doc.run.resume_from.max(index + 1);
        Ok(())
    }

    fn update_metric(&self, name: &str, delta: u64) -> Result<(), CheckpointError> {
        let mut guard = self.current.lock().unwrap();
        let (_, doc) = guard.as_mut().ok_or(CheckpointError::NoActiveRun)?;
        *doc.run.metrics.entry(name.to_string()).or_default() += delta;
        Ok(())
    }

    fn symbol_checkpoint(&self, symbol: &str) -> Option<SymbolCheckpoint> {
        let guard = self.current.lock().unwrap();
        guard
            .as_ref()
            .and_then(|(_, doc)| doc.symbols.get(symbol).cloned())
    }

    fn current_run(&self) -> Option<RunCheckpoint> {
        let guard = self.current.lock().unwrap();
        guard.as_ref().map(|(_, doc)| doc.run.clone())
    }

    fn complete(&self) -> Result<RunCheckpoint, CheckpointError> {
        self.finalize(RunStatus::Completed, None)
    }

    fn fail(&self, reason: &str) -> Result<RunCheckpoint, CheckpointError> {
        let some_succeeded = self
            .current_run()
            .map(|run| run.metrics.get("symbols_succeeded").copied().unwrap_or(0) > 0)
            .unwrap_or(false);
        let status = if reason == "cancelled" && some_succeeded {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        };
        self.finalize(status, Some(reason.to_string()))
    }

    fn flush(&self) -> Result<(), CheckpointError> {
        let guard = self.current.lock().unwrap();
        match guard.as_ref() {
            Some((path, doc)) => Self::write_document(path, doc),
            None => Ok(()),
        }
    }

    fn reset_symbol(&self, symbol: &str) -> Result<(), CheckpointError> {
        let mut guard = self.current.lock().unwrap();
        if let Some((path, doc)) = guard.as_mut() {
            doc.symbols.remove(symbol);
            return Self::write_document(path, doc);
        }
        drop(guard);

        // No active run: edit the newest document on disk.
        for path in self.run_files_newest_first()? {
            if let Some(mut doc) = Self::load_document(&path) {
                if doc.symbols.remove(symbol).is_some() {
                    Self::write_document(&path, &doc)?;
                }
                return Ok(());
            }
        }
        Ok(())
    }
}
