//! Lifecycle controller.
//!
//! `IngestEngine` owns the dispatch queue, the writer thread and the registry
//! of live accumulators. Share it behind an `Arc`; every method takes `&self`.
//!
//! Stop sequence:
//!   1. seal the queue and flush every live accumulator's partial batch,
//!   2. close the queue, which wakes the writer,
//!   3. join the writer once it has drained the queue and closed its
//!      connection.

use std::{
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    thread::JoinHandle,
    time::Duration,
};

use crate::config::{DatabaseConfig, WriterConfig};
use crate::db::{
    spawn_writer, BatchWriter, ConnectionProvider, Connector, StateCell, WriterCounters,
    WriterOutcome, WriterState, WriterStats,
};

use super::{
    accumulator::{BatchAccumulator, PendingFlush},
    batch::{Batch, Record},
    queue::{dispatch_queue, DispatchQueue, DispatchReceiver},
    IngestError,
};

/// Returned by [`IngestEngine::stop`].
#[derive(Debug, Default)]
pub struct StopReport {
    pub stats:    WriterStats,
    /// Batches kept under the `retain` exhausted policy, oldest first. Only
    /// the first `stop()` hands them out.
    pub retained: Vec<Batch>,
}

enum Lifecycle<C: Connector> {
    Ready { connector: C, rx: DispatchReceiver },
    Running(JoinHandle<WriterOutcome>),
    Stopped,
}

/// Asynchronous batch-insertion engine.
pub struct IngestEngine<C: Connector = ConnectionProvider> {
    cfg:              WriterConfig,
    checkpoint_every: Option<Duration>,
    queue:            DispatchQueue,
    lifecycle:        Mutex<Lifecycle<C>>,
    registry:         Mutex<Vec<Weak<dyn PendingFlush>>>,
    state:            Arc<StateCell>,
    counters:         Arc<WriterCounters>,
    /// Set by the first `stop()`; later calls return these stats.
    stopped:          Mutex<Option<WriterStats>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl IngestEngine<ConnectionProvider> {
    /// Engine over the SQLite file named in `db`. Nothing is opened until
    /// [`start`](Self::start).
    pub fn open(db: &DatabaseConfig, cfg: WriterConfig) -> Self {
        let checkpoint = Duration::from_secs(db.checkpoint_seconds);
        Self::with_connector(ConnectionProvider::from_config(db), cfg)
            .with_checkpoint_every(checkpoint)
    }
}

impl<C: Connector> IngestEngine<C> {
    pub fn with_connector(connector: C, cfg: WriterConfig) -> Self {
        let (queue, rx) = dispatch_queue(cfg.queue_capacity());
        Self {
            cfg,
            checkpoint_every: None,
            queue,
            lifecycle: Mutex::new(Lifecycle::Ready { connector, rx }),
            registry: Mutex::new(Vec::new()),
            state: Arc::new(StateCell::new(WriterState::Idle)),
            counters: Arc::new(WriterCounters::default()),
            stopped: Mutex::new(None),
        }
    }

    /// Idle WAL checkpoint interval; zero disables it.
    pub fn with_checkpoint_every(mut self, every: Duration) -> Self {
        self.checkpoint_every = (!every.is_zero()).then_some(every);
        self
    }

    /// New producer handle for record kind `R`, sized to the configured
    /// batch size. Its partial batch is flushed on `stop()`.
    pub fn accumulator<R: Record>(&self) -> BatchAccumulator<R> {
        let acc = BatchAccumulator::new(self.cfg.batch_size, self.queue.clone());
        let mut registry = lock(&self.registry);
        registry.retain(|w| w.strong_count() > 0);
        registry.push(Arc::downgrade(&acc.pending_handle()));
        acc
    }

    /// Queue an already-built batch, e.g. one handed back by a previous
    /// engine's [`StopReport::retained`].
    pub fn submit(&self, batch: Batch) -> Result<(), IngestError> {
        if !self.queue.is_accepting() {
            return Err(IngestError::Stopped { table: batch.table(), rows: batch.len() });
        }
        self.queue
            .push(batch)
            .map_err(|e| {
                let b = e.into_batch();
                IngestError::Stopped { table: b.table(), rows: b.len() }
            })
    }

    /// Acquire the writer's connection on this thread and launch the writer.
    pub fn start(&self) -> Result<(), IngestError> {
        let mut lifecycle = lock(&self.lifecycle);
        self.start_locked(&mut lifecycle)
    }

    fn start_locked(&self, lifecycle: &mut Lifecycle<C>) -> Result<(), IngestError> {
        let (connector, rx) = match mem::replace(lifecycle, Lifecycle::Stopped) {
            Lifecycle::Ready { connector, rx } => (connector, rx),
            other => {
                *lifecycle = other;
                return Err(IngestError::AlreadyStarted);
            }
        };

        let sink = match connector.acquire() {
            Ok(sink) => sink,
            Err(e) => {
                log::error!("cannot start ingest engine: {}", e);
                *lifecycle = Lifecycle::Ready { connector, rx };
                return Err(e.into());
            }
        };

        let writer = BatchWriter::new(
            connector,
            sink,
            rx,
            &self.cfg,
            self.state.clone(),
            self.counters.clone(),
        )
        .with_checkpoint_every(self.checkpoint_every);

        let handle = spawn_writer(writer).map_err(IngestError::Spawn)?;
        *lifecycle = Lifecycle::Running(handle);
        log::info!(
            "ingest engine started (batch size {}, queue {})",
            self.cfg.batch_size,
            self.cfg
                .queue_capacity()
                .map_or_else(|| "unbounded".to_string(), |n| n.to_string())
        );
        Ok(())
    }

    /// Flush, drain and join. See the module docs for the order of steps.
    ///
    /// Returns `ShutdownFlush` if any batch could not be written during the
    /// final drain; the engine is stopped either way.
    pub fn stop(&self) -> Result<StopReport, IngestError> {
        let mut stopped = lock(&self.stopped);
        if let Some(stats) = *stopped {
            return Ok(StopReport { stats, retained: Vec::new() });
        }

        log::info!("stopping ingest engine");
        self.queue.seal();

        let mut lifecycle = lock(&self.lifecycle);
        if matches!(*lifecycle, Lifecycle::Ready { .. }) && self.has_work() {
            log::info!("engine was never started; starting it to drain queued batches");
            if let Err(e) = self.start_locked(&mut lifecycle) {
                self.queue.close();
                *lifecycle = Lifecycle::Stopped;
                self.state.set(WriterState::Stopped);
                *stopped = Some(self.counters.snapshot());
                return Err(e);
            }
        }

        let (flush_batches, flush_rows) = self.flush_accumulators();
        self.queue.close();

        let outcome = match mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(handle) => match handle.join() {
                Ok(outcome) => outcome,
                Err(_) => {
                    log::error!("writer thread panicked");
                    self.state.set(WriterState::Stopped);
                    *stopped = Some(self.counters.snapshot());
                    return Err(IngestError::WriterPanicked);
                }
            },
            Lifecycle::Ready { .. } | Lifecycle::Stopped => {
                self.state.set(WriterState::Stopped);
                WriterOutcome::default()
            }
        };

        let stats = self.counters.snapshot();
        *stopped = Some(stats);
        log::info!(
            "ingest engine stopped: {} rows written, {} batches failed",
            stats.rows_written,
            stats.batches_failed
        );

        let batches = outcome.shutdown_batches + flush_batches;
        let rows = outcome.shutdown_rows + flush_rows;
        if batches > 0 {
            return Err(IngestError::ShutdownFlush {
                batches,
                rows,
                stats,
                retained: outcome.retained,
            });
        }
        Ok(StopReport { stats, retained: outcome.retained })
    }

    fn live_accumulators(&self) -> Vec<Arc<dyn PendingFlush>> {
        lock(&self.registry).iter().filter_map(Weak::upgrade).collect()
    }

    fn has_work(&self) -> bool {
        !self.queue.is_empty() || self.live_accumulators().iter().any(|a| a.pending() > 0)
    }

    /// Submit every partial batch; returns the batches and rows that could
    /// not be handed to the writer.
    fn flush_accumulators(&self) -> (u64, u64) {
        let mut failed = (0, 0);
        for acc in self.live_accumulators() {
            match acc.flush_pending() {
                Ok(0) => {}
                Ok(n) => log::debug!("flushed {} pending rows for {}", n, acc.table()),
                Err(IngestError::Stopped { rows, .. }) => {
                    failed.0 += 1;
                    failed.1 += rows as u64;
                }
                Err(e) => log::error!("flushing {} failed: {}", acc.table(), e),
            }
        }
        failed
    }

    /// Live writer counters.
    pub fn stats(&self) -> WriterStats {
        self.counters.snapshot()
    }

    pub fn state(&self) -> WriterState {
        self.state.get()
    }

    /// Batches waiting for the writer.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_running(&self) -> bool {
        matches!(*lock(&self.lifecycle), Lifecycle::Running(_))
    }
}

impl<C: Connector> Drop for IngestEngine<C> {
    fn drop(&mut self) {
        if lock(&self.stopped).is_some() {
            return;
        }
        if let Err(e) = self.stop() {
            log::error!("stopping ingest engine on drop: {}", e);
        }
    }
}
