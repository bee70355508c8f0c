// src/lib.rs
// ────────────────────────────────────────────────────────────────────────────
// Public library entry point.  Re-export everything for both `main.rs` and
// integration tests.

pub mod config;
pub mod db;
pub mod load;
pub mod logging;
pub mod pipeline;

pub use pipeline::{BatchAccumulator, IngestEngine, IngestError, StopReport};
