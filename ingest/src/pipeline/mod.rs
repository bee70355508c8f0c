//! Producer-facing half of the engine: accumulators, the dispatch queue and
//! the lifecycle controller that owns the writer thread.

pub mod accumulator;
pub mod batch;
pub mod engine;
pub mod queue;

use shared::Table;
use thiserror::Error;

use crate::db::{ConnectionError, WriterStats};

pub use accumulator::BatchAccumulator;
pub use batch::{Batch, Record};
pub use engine::{IngestEngine, StopReport};
pub use queue::{dispatch_queue, DispatchQueue, DispatchReceiver, Pop, PushError};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("engine already started")]
    AlreadyStarted,

    #[error("engine is stopping, {rows} rows for {table} not accepted")]
    Stopped { table: Table, rows: usize },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("cannot spawn writer thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("writer thread panicked")]
    WriterPanicked,

    #[error("{batches} batches ({rows} rows) failed while draining on stop")]
    ShutdownFlush {
        batches:  u64,
        rows:     u64,
        stats:    WriterStats,
        /// Batches kept under the `retain` policy.
        retained: Vec<Batch>,
    },
}
