// src/db/mod.rs
//! Public façade for DB helpers (re-exports plus spawn_writer).

pub mod backoff;
pub mod batch_inserts;
pub mod connection;
pub mod db_writer;
pub mod maintenance;
pub mod sink;

use std::{io, thread::{self, JoinHandle}};

pub use backoff::{Backoff, RetryError};
pub use batch_inserts::{insert_rows, write_batch, BatchInsert};
pub use connection::{init_database, is_locked, ConnectionError, ConnectionProvider, SessionConfig};
pub use db_writer::{BatchFailure, BatchWriter, StateCell, WriterCounters, WriterOutcome, WriterState, WriterStats};
pub use sink::{BatchSink, Connector, SqliteSink, WriteError};

/// Run `writer` on its own named thread.
pub fn spawn_writer<C: Connector>(writer: BatchWriter<C>) -> io::Result<JoinHandle<WriterOutcome>> {
    thread::Builder::new()
        .name("ingest-writer".into())
        .spawn(move || writer.run())
}
