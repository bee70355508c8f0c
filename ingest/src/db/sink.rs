// src/db/sink.rs
//! Seam between the batch writer and the database.
//!
//! The writer only needs "get me a connection" and "write this batch";
//! keeping both behind traits lets tests drive the retry and reconnect paths
//! with injected lock errors.

use rusqlite::Connection;
use thiserror::Error;

use crate::db::{batch_inserts, connection::{is_locked, ConnectionError, ConnectionProvider}, maintenance};
use crate::pipeline::Batch;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),
}

impl WriteError {
    /// Lock contention; the same batch may succeed if tried again.
    pub fn is_locked(&self) -> bool {
        match self {
            WriteError::Sql(e) => is_locked(e),
        }
    }
}

/// Produces fresh sinks; called once at start and again on reconnect.
pub trait Connector: Send + 'static {
    type Sink: BatchSink;

    fn acquire(&self) -> Result<Self::Sink, ConnectionError>;
}

/// A live connection owned by the writer thread.
pub trait BatchSink: Send + 'static {
    /// Write the whole batch or nothing.
    fn write(&mut self, batch: &Batch) -> Result<(), WriteError>;

    /// Idle-time maintenance.
    fn checkpoint(&mut self) -> Result<(), WriteError> {
        Ok(())
    }

    fn close(self) -> Result<(), WriteError>;
}

/// Owns one SQLite connection.
pub struct SqliteSink {
    conn: Connection,
}

impl SqliteSink {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }
}

impl BatchSink for SqliteSink {
    fn write(&mut self, batch: &Batch) -> Result<(), WriteError> {
        batch_inserts::write_batch(&mut self.conn, batch)?;
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<(), WriteError> {
        maintenance::checkpoint(&self.conn)?;
        Ok(())
    }

    fn close(self) -> Result<(), WriteError> {
        if let Err(e) = maintenance::checkpoint(&self.conn) {
            log::warn!("WAL checkpoint before close failed: {}", e);
        }
        self.conn.close().map_err(|(_, e)| WriteError::Sql(e))
    }
}

impl Connector for ConnectionProvider {
    type Sink = SqliteSink;

    fn acquire(&self) -> Result<SqliteSink, ConnectionError> {
        ConnectionProvider::acquire(self).map(SqliteSink::new)
    }
}
