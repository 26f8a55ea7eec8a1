//! BarSync Runner: sync orchestration around the core engine.
//!
//! This crate owns everything a scheduled sync run needs besides the
//! provider/fallback machinery in `barsync-core`:
//! - Durable run + per-symbol checkpoints with crash-safe resumption
//! - The sqlite bar store (idempotent upserts) and symbols reference table
//! - The ordered symbol universe with limit/filter restriction
//! - The sync driver state machine tying it all together
//! - TOML run configuration with blake3 run-id fingerprints

pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod storage;
pub mod universe;

pub use checkpoint::{
    CheckpointError, CheckpointStore, JsonCheckpointStore, RunCheckpoint, RunStatus,
    SymbolCheckpoint,
};
pub use config::SyncConfig;
pub use driver::{DriverError, SyncDriver, SyncReport};
pub use storage::{MemoryBarStore, SqliteBarStore, StorageError, StorageWriter};
pub use universe::{Universe, UniverseFilter};
