//! Domain types shared across the sync engine.

pub mod bar;

pub use bar::Bar;
