//! Per-producer batch accumulator.
//!
//! Each accumulator is bound to one table through its record type and fills
//! one batch at a time. When the batch reaches the threshold it is swapped
//! for an empty one and handed to the dispatch queue while the lock is still
//! held, so batches of one accumulator reach the writer in fill order.

use std::{
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use shared::{Table, Timeframe};

use super::{batch::Record, queue::DispatchQueue, IngestError};

/// Type-erased view the engine keeps to flush partial batches on stop.
pub(crate) trait PendingFlush: Send + Sync {
    fn flush_pending(&self) -> Result<usize, IngestError>;
    fn pending(&self) -> usize;
    fn table(&self) -> Table;
}

pub(crate) struct PendingBuffer<R: Record> {
    rows:      Mutex<Vec<R>>,
    threshold: usize,
    queue:     DispatchQueue,
}

impl<R: Record> PendingBuffer<R> {
    fn lock(&self) -> MutexGuard<'_, Vec<R>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit whatever is buffered. Allowed while the queue is sealed.
    fn submit(&self, rows: &mut Vec<R>) -> Result<usize, IngestError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let full = mem::replace(rows, Vec::with_capacity(self.threshold));
        let n = full.len();
        self.queue.push(R::into_batch(full)).map_err(|e| {
            let refused = e.into_batch().len();
            log::error!("{} rows for {} refused: engine stopped", refused, R::TABLE);
            IngestError::Stopped { table: R::TABLE, rows: refused }
        })?;
        Ok(n)
    }

    fn append<I>(&self, records: I) -> Result<usize, IngestError>
    where
        I: IntoIterator<Item = R>,
    {
        let mut rows = self.lock();
        if !self.queue.is_accepting() {
            return Err(self.reject(records.into_iter().count()));
        }

        let mut accepted = 0;
        for rec in records {
            rows.push(rec);
            accepted += 1;
            if rows.len() >= self.threshold {
                self.submit(&mut rows)?;
            }
        }
        Ok(accepted)
    }

    fn reject(&self, rows: usize) -> IngestError {
        log::warn!("{} rows for {} rejected: engine is stopping", rows, R::TABLE);
        metrics::counter!("ingest_rows_rejected_total", "table" => R::TABLE.name())
            .increment(rows as u64);
        IngestError::Stopped { table: R::TABLE, rows }
    }
}

impl<R: Record> PendingFlush for PendingBuffer<R> {
    fn flush_pending(&self) -> Result<usize, IngestError> {
        let mut rows = self.lock();
        self.submit(&mut rows)
    }

    fn pending(&self) -> usize {
        self.lock().len()
    }

    fn table(&self) -> Table {
        R::TABLE
    }
}

/// Producer handle for one record kind. Obtain it from
/// [`IngestEngine::accumulator`](super::IngestEngine::accumulator).
///
/// Every method reports whether records were *accepted*; persistence
/// failures surface through the writer's logs, metrics and the stop report.
pub struct BatchAccumulator<R: Record> {
    buffer: Arc<PendingBuffer<R>>,
}

impl<R: Record> BatchAccumulator<R> {
    pub(crate) fn new(threshold: usize, queue: DispatchQueue) -> Self {
        Self {
            buffer: Arc::new(PendingBuffer {
                rows: Mutex::new(Vec::with_capacity(threshold.min(4_096))),
                threshold: threshold.max(1),
                queue,
            }),
        }
    }

    pub(crate) fn pending_handle(&self) -> Arc<dyn PendingFlush> {
        self.buffer.clone()
    }

    pub fn table(&self) -> Table {
        R::TABLE
    }

    pub fn threshold(&self) -> usize {
        self.buffer.threshold
    }

    /// Records buffered but not yet handed to the writer.
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Build a record from `point` and buffer it.
    pub fn enqueue(
        &self,
        symbol_id: i64,
        timeframe: Timeframe,
        point: R::Point,
    ) -> Result<(), IngestError> {
        self.push(R::from_point(symbol_id, timeframe, point))
    }

    pub fn push(&self, record: R) -> Result<(), IngestError> {
        self.buffer.append(std::iter::once(record)).map(|_| ())
    }

    /// Bulk variant of [`enqueue`](Self::enqueue). Every complete
    /// threshold-sized chunk is submitted before this returns; only the tail
    /// stays buffered. Returns the number of records accepted.
    pub fn enqueue_sequence<I>(
        &self,
        symbol_id: i64,
        timeframe: Timeframe,
        points: I,
    ) -> Result<usize, IngestError>
    where
        I: IntoIterator<Item = R::Point>,
    {
        self.push_all(
            points
                .into_iter()
                .map(|p| R::from_point(symbol_id, timeframe, p)),
        )
    }

    pub fn push_all<I>(&self, records: I) -> Result<usize, IngestError>
    where
        I: IntoIterator<Item = R>,
    {
        self.buffer.append(records)
    }

    /// Submit the partial batch now. Returns the number of rows submitted.
    pub fn flush(&self) -> Result<usize, IngestError> {
        self.buffer.flush_pending()
    }
}

impl<R: Record> Drop for BatchAccumulator<R> {
    fn drop(&mut self) {
        if self.pending() == 0 {
            return;
        }
        if let Err(e) = self.flush() {
            log::error!("dropping accumulator for {}: {}", R::TABLE, e);
        }
    }
}
