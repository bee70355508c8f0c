// src/db/db_writer.rs
//! The single consumer of the dispatch queue.
//!
//! ```text
//!            pop                 lock error
//!   Idle ──────────▶ Writing ───────────────▶ Retrying
//!    ▲   ◀────────── │  ▲  ◀──── after delay ────┘
//!    │    committed  │  └─ cap hit: reconnect, one more attempt
//!    │   or failed   │
//!    └── closed & empty ──▶ Stopped
//! ```
//!
//! All database work is synchronous on the writer thread; the connection
//! never leaves it.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    thread::sleep,
    time::{Duration, Instant},
};

use thiserror::Error;

use crate::config::{ExhaustedPolicy, WriterConfig};
use crate::db::{
    backoff::Backoff,
    connection::ConnectionError,
    sink::{BatchSink, Connector, WriteError},
};
use crate::pipeline::{
    queue::{DispatchReceiver, Pop},
    Batch,
};

/// Where the writer loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WriterState {
    Idle = 0,
    Writing = 1,
    Retrying = 2,
    Stopped = 3,
}

/// Lock-free cell so other threads can observe the writer's state.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: WriterState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn set(&self, state: WriterState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn get(&self) -> WriterState {
        match self.0.load(Ordering::Acquire) {
            0 => WriterState::Idle,
            1 => WriterState::Writing,
            2 => WriterState::Retrying,
            _ => WriterState::Stopped,
        }
    }
}

/// Snapshot of the writer's cumulative counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub rows_written:    u64,
    pub batches_written: u64,
    pub rows_failed:     u64,
    pub batches_failed:  u64,
    pub reconnects:      u64,
}

#[derive(Debug, Default)]
pub struct WriterCounters {
    rows_written:    AtomicU64,
    batches_written: AtomicU64,
    rows_failed:     AtomicU64,
    batches_failed:  AtomicU64,
    reconnects:      AtomicU64,
}

impl WriterCounters {
    pub fn snapshot(&self) -> WriterStats {
        WriterStats {
            rows_written:    self.rows_written.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            rows_failed:     self.rows_failed.load(Ordering::Relaxed),
            batches_failed:  self.batches_failed.load(Ordering::Relaxed),
            reconnects:      self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Why a batch did not make it to the database.
#[derive(Debug, Error)]
pub enum BatchFailure {
    #[error("database still locked after {attempts} attempts and a reconnect")]
    LockExhausted { attempts: u32 },

    #[error("write rejected: {0}")]
    Rejected(#[source] WriteError),

    #[error("no connection: {0}")]
    Connection(#[from] ConnectionError),
}

impl BatchFailure {
    /// Lock exhaustion and lost connections may succeed later; a rejected
    /// batch never will.
    pub fn is_transient(&self) -> bool {
        !matches!(self, BatchFailure::Rejected(_))
    }
}

/// What the writer hands back when it stops.
#[derive(Debug, Default)]
pub struct WriterOutcome {
    /// Transiently failed batches kept under [`ExhaustedPolicy::Retain`].
    pub retained:          Vec<Batch>,
    /// Failures that happened after shutdown sealed the queue.
    pub shutdown_batches:  u64,
    pub shutdown_rows:     u64,
}

/// Batched upsert worker. Construct with [`BatchWriter::new`] and call
/// [`run`](BatchWriter::run) on a dedicated thread.
pub struct BatchWriter<C: Connector> {
    connector:      C,
    sink:           Option<C::Sink>,
    rx:             DispatchReceiver,
    retry:          Backoff,
    poll_interval:  Duration,
    report_every:   u64,
    on_exhausted:   ExhaustedPolicy,
    checkpoint_every: Option<Duration>,
    last_checkpoint: Instant,
    since_report:   u64,
    window_start:   Instant,
    state:          Arc<StateCell>,
    counters:       Arc<WriterCounters>,
    outcome:        WriterOutcome,
}

impl<C: Connector> BatchWriter<C> {
    pub fn new(
        connector: C,
        sink: C::Sink,
        rx: DispatchReceiver,
        cfg: &WriterConfig,
        state: Arc<StateCell>,
        counters: Arc<WriterCounters>,
    ) -> Self {
        Self {
            connector,
            sink: Some(sink),
            rx,
            retry: Backoff::from(&cfg.retry),
            poll_interval: cfg.poll_interval,
            report_every: cfg.report_every_rows,
            on_exhausted: cfg.on_exhausted,
            checkpoint_every: None,
            last_checkpoint: Instant::now(),
            since_report: 0,
            window_start: Instant::now(),
            state,
            counters,
            outcome: WriterOutcome::default(),
        }
    }

    /// Run a WAL checkpoint whenever the writer has been idle for `every`.
    pub fn with_checkpoint_every(mut self, every: Option<Duration>) -> Self {
        self.checkpoint_every = every.filter(|d| !d.is_zero());
        self
    }

    /// Consume batches until the queue is closed and empty, then close the
    /// connection.
    pub fn run(mut self) -> WriterOutcome {
        log::info!("batch writer started");
        loop {
            self.state.set(WriterState::Idle);
            match self.rx.pop(self.poll_interval) {
                Pop::Batch(batch) => self.persist(batch),
                Pop::Timeout => self.idle_maintenance(),
                Pop::Drained => break,
            }
        }

        if let Some(sink) = self.sink.take() {
            if let Err(e) = sink.close() {
                log::warn!("closing writer connection failed: {}", e);
            }
        }
        self.state.set(WriterState::Stopped);

        let stats = self.counters.snapshot();
        log::info!(
            "batch writer stopped: {} rows in {} batches, {} batches failed",
            stats.rows_written,
            stats.batches_written,
            stats.batches_failed
        );
        self.outcome
    }

    fn persist(&mut self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        metrics::gauge!("ingest_queue_depth").set(self.rx.len() as f64);

        let started = Instant::now();
        match self.write_with_retry(&batch) {
            Ok(()) => self.record_success(&batch, started.elapsed()),
            Err(failure) => self.record_failure(batch, failure),
        }
    }

    /// Lock errors are retried on the same connection up to the cap; after
    /// that the connection is replaced and the batch gets one last attempt.
    fn write_with_retry(&mut self, batch: &Batch) -> Result<(), BatchFailure> {
        let table = batch.table();
        let max = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.state.set(WriterState::Writing);
            match self.sink()?.write(batch) {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_locked() => return Err(BatchFailure::Rejected(e)),
                Err(_) if attempt >= max => break,
                Err(_) => {
                    self.state.set(WriterState::Retrying);
                    let delay = self.retry.delay(attempt);
                    log::warn!(
                        "Database is locked writing {}, retrying {}/{} in {:?}",
                        table, attempt, max, delay
                    );
                    sleep(delay);
                }
            }
        }

        log::warn!("Max retries reached on {}. Refreshing connection.", table);
        self.replace_connection()?;

        self.state.set(WriterState::Writing);
        match self.sink()?.write(batch) {
            Ok(()) => Ok(()),
            Err(e) if e.is_locked() => Err(BatchFailure::LockExhausted { attempts: attempt + 1 }),
            Err(e) => Err(BatchFailure::Rejected(e)),
        }
    }

    /// Current sink, reconnecting first if a previous failure dropped it.
    fn sink(&mut self) -> Result<&mut C::Sink, BatchFailure> {
        let sink = match self.sink.take() {
            Some(sink) => sink,
            None => {
                let fresh = self.connector.acquire()?;
                self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("ingest_reconnects_total").increment(1);
                log::info!("writer connection re-established");
                fresh
            }
        };
        Ok(self.sink.insert(sink))
    }

    fn replace_connection(&mut self) -> Result<(), BatchFailure> {
        if let Some(old) = self.sink.take() {
            if let Err(e) = old.close() {
                log::warn!("closing stale connection failed: {}", e);
            }
        }
        self.sink()?;
        Ok(())
    }

    fn record_success(&mut self, batch: &Batch, took: Duration) {
        let rows = batch.len() as u64;
        self.counters.rows_written.fetch_add(rows, Ordering::Relaxed);
        self.counters.batches_written.fetch_add(1, Ordering::Relaxed);

        let table = batch.table().name();
        metrics::counter!("ingest_rows_written_total", "table" => table).increment(rows);
        metrics::histogram!("ingest_batch_write_seconds", "table" => table)
            .record(took.as_secs_f64());
        log::debug!("Inserted {} rows into {} in {:.2} seconds", rows, table, took.as_secs_f64());

        self.since_report += rows;
        if self.report_every > 0 && self.since_report >= self.report_every {
            log::info!(
                "Inserted {} rows in {:.2} seconds",
                self.since_report,
                self.window_start.elapsed().as_secs_f64()
            );
            self.since_report = 0;
            self.window_start = Instant::now();
        }
    }

    fn record_failure(&mut self, batch: Batch, failure: BatchFailure) {
        let rows = batch.len() as u64;
        let table = batch.table();
        self.counters.rows_failed.fetch_add(rows, Ordering::Relaxed);
        self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ingest_batches_failed_total", "table" => table.name()).increment(1);
        metrics::counter!("ingest_rows_failed_total", "table" => table.name()).increment(rows);

        if self.rx.is_sealed() {
            self.outcome.shutdown_batches += 1;
            self.outcome.shutdown_rows += rows;
        }

        let retain = failure.is_transient() && self.on_exhausted == ExhaustedPolicy::Retain;
        if retain {
            log::error!("batch of {} rows for {} failed, retained: {}", rows, table, failure);
            self.outcome.retained.push(batch);
        } else {
            log::error!("batch of {} rows for {} failed, dropped: {}", rows, table, failure);
        }
    }

    fn idle_maintenance(&mut self) {
        let Some(every) = self.checkpoint_every else { return };
        if self.last_checkpoint.elapsed() < every {
            return;
        }
        self.last_checkpoint = Instant::now();
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.checkpoint() {
                log::warn!("WAL checkpoint failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::pipeline::queue::dispatch_queue;
    use chrono::{TimeZone, Utc};
    use rusqlite::ffi;
    use shared::{IndicatorRecord, Timeframe};
    use std::sync::{atomic::AtomicUsize, Mutex};

    /// Shared script for every sink the fake connector hands out.
    #[derive(Default)]
    struct Script {
        locked_left:   AtomicUsize,
        reject_tables: Mutex<Vec<shared::Table>>,
        written:       Mutex<Vec<usize>>,
        opened:        AtomicUsize,
        fail_connect:  AtomicUsize,
        checkpoints:   AtomicUsize,
    }

    struct FakeConnector(Arc<Script>);
    struct FakeSink(Arc<Script>);

    impl Connector for FakeConnector {
        type Sink = FakeSink;
        fn acquire(&self) -> Result<FakeSink, ConnectionError> {
            if self.0.fail_connect.load(Ordering::SeqCst) > 0 {
                self.0.fail_connect.fetch_sub(1, Ordering::SeqCst);
                return Err(ConnectionError::Open(rusqlite::Error::SqliteFailure(
                    ffi::Error::new(ffi::SQLITE_CANTOPEN),
                    None,
                )));
            }
            self.0.opened.fetch_add(1, Ordering::SeqCst);
            Ok(FakeSink(self.0.clone()))
        }
    }

    impl BatchSink for FakeSink {
        fn write(&mut self, batch: &Batch) -> Result<(), WriteError> {
            if self.0.reject_tables.lock().unwrap().contains(&batch.table()) {
                return Err(WriteError::Sql(rusqlite::Error::SqliteFailure(
                    ffi::Error::new(ffi::SQLITE_CONSTRAINT),
                    Some("CHECK constraint failed".into()),
                )));
            }
            let left = self.0.locked_left.load(Ordering::SeqCst);
            if left > 0 {
                self.0.locked_left.store(left - 1, Ordering::SeqCst);
                return Err(WriteError::Sql(rusqlite::Error::SqliteFailure(
                    ffi::Error::new(ffi::SQLITE_BUSY),
                    Some("database is locked".into()),
                )));
            }
            self.0.written.lock().unwrap().push(batch.len());
            Ok(())
        }

        fn checkpoint(&mut self) -> Result<(), WriteError> {
            self.0.checkpoints.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(self) -> Result<(), WriteError> {
            Ok(())
        }
    }

    fn cfg(policy: ExhaustedPolicy) -> WriterConfig {
        WriterConfig {
            poll_interval: Duration::from_millis(5),
            on_exhausted: policy,
            retry: RetryConfig {
                max_attempts: 5,
                base_delay: Duration::from_millis(1),
                factor: 1.0,
                max_delay: None,
            },
            ..WriterConfig::default()
        }
    }

    fn rows(n: usize) -> Batch {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Batch::Indicators(
            (0..n)
                .map(|i| IndicatorRecord {
                    symbol_id: 1,
                    timeframe: Timeframe::M1,
                    timestamp: ts,
                    indicator_name: format!("I{i}"),
                    indicator_value: i as f64,
                })
                .collect(),
        )
    }

    /// Push `batches`, close the queue and run the writer to completion.
    fn run(script: &Arc<Script>, policy: ExhaustedPolicy, batches: Vec<Batch>)
        -> (WriterOutcome, WriterStats, WriterState)
    {
        let (q, rx) = dispatch_queue(None);
        for b in batches {
            q.push(b).unwrap();
        }
        q.close();

        let connector = FakeConnector(script.clone());
        let sink = connector.acquire().unwrap();
        let state = Arc::new(StateCell::new(WriterState::Idle));
        let counters = Arc::new(WriterCounters::default());
        let outcome = BatchWriter::new(connector, sink, rx, &cfg(policy), state.clone(), counters.clone())
            .run();
        (outcome, counters.snapshot(), state.get())
    }

    #[test]
    fn fewer_lock_errors_than_cap_still_succeed() {
        let script = Arc::new(Script::default());
        script.locked_left.store(4, Ordering::SeqCst);

        let (outcome, stats, state) = run(&script, ExhaustedPolicy::Discard, vec![rows(3)]);

        assert_eq!(stats.rows_written, 3);
        assert_eq!(stats.batches_failed, 0);
        assert_eq!(stats.reconnects, 0);
        assert!(outcome.retained.is_empty());
        assert_eq!(state, WriterState::Stopped);
    }

    #[test]
    fn exhausted_cap_reconnects_and_retries_once() {
        let script = Arc::new(Script::default());
        script.locked_left.store(5, Ordering::SeqCst);

        let (_, stats, _) = run(&script, ExhaustedPolicy::Discard, vec![rows(2)]);

        assert_eq!(stats.rows_written, 2);
        assert_eq!(stats.reconnects, 1);
        assert_eq!(script.opened.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn more_lock_errors_than_cap_fail_once_and_writer_continues() {
        let script = Arc::new(Script::default());
        script.locked_left.store(6, Ordering::SeqCst);

        let (outcome, stats, state) =
            run(&script, ExhaustedPolicy::Discard, vec![rows(2), rows(7)]);

        assert_eq!(stats.batches_failed, 1);
        assert_eq!(stats.rows_failed, 2);
        assert_eq!(stats.rows_written, 7);
        assert_eq!(*script.written.lock().unwrap(), vec![7]);
        assert!(outcome.retained.is_empty());
        assert_eq!(outcome.shutdown_batches, 1, "queue was already closed");
        assert_eq!(state, WriterState::Stopped);
    }

    #[test]
    fn retain_policy_keeps_locked_out_batch() {
        let script = Arc::new(Script::default());
        script.locked_left.store(100, Ordering::SeqCst);

        let (outcome, stats, _) = run(&script, ExhaustedPolicy::Retain, vec![rows(4)]);

        assert_eq!(stats.batches_failed, 1);
        assert_eq!(outcome.retained, vec![rows(4)]);
    }

    #[test]
    fn rejected_batch_is_not_retried_or_retained() {
        let script = Arc::new(Script::default());
        script.reject_tables.lock().unwrap().push(shared::Table::Indicators);

        let ohlcv = Batch::Ohlcv(Vec::new());
        let (outcome, stats, _) =
            run(&script, ExhaustedPolicy::Retain, vec![rows(3), ohlcv]);

        assert_eq!(stats.batches_failed, 1);
        assert_eq!(stats.reconnects, 0);
        assert!(outcome.retained.is_empty());
        assert_eq!(script.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lost_connection_is_reacquired_for_next_batch() {
        let script = Arc::new(Script::default());
        // Exhaust the cap on the first batch, then fail the reconnect once.
        script.locked_left.store(5, Ordering::SeqCst);

        let (q, rx) = dispatch_queue(None);
        q.push(rows(1)).unwrap();
        q.push(rows(2)).unwrap();
        q.close();

        let connector = FakeConnector(script.clone());
        let sink = connector.acquire().unwrap();
        script.fail_connect.store(1, Ordering::SeqCst);
        let counters = Arc::new(WriterCounters::default());
        let outcome = BatchWriter::new(
            connector,
            sink,
            rx,
            &cfg(ExhaustedPolicy::Retain),
            Arc::new(StateCell::new(WriterState::Idle)),
            counters.clone(),
        )
        .run();

        let stats = counters.snapshot();
        assert_eq!(stats.batches_failed, 1);
        assert_eq!(outcome.retained, vec![rows(1)]);
        assert_eq!(stats.rows_written, 2);
        assert_eq!(stats.reconnects, 1);
    }

    /// Let the writer idle on an empty open queue for `idle`, then close it.
    fn idle_for(script: &Arc<Script>, every: Option<Duration>, idle: Duration) {
        let (q, rx) = dispatch_queue(None);
        let connector = FakeConnector(script.clone());
        let sink = connector.acquire().unwrap();
        let writer = BatchWriter::new(
            connector,
            sink,
            rx,
            &cfg(ExhaustedPolicy::Discard),
            Arc::new(StateCell::new(WriterState::Idle)),
            Arc::new(WriterCounters::default()),
        )
        .with_checkpoint_every(every);

        let handle = std::thread::spawn(move || writer.run());
        std::thread::sleep(idle);
        q.close();
        handle.join().unwrap();
    }

    #[test]
    fn idle_writer_checkpoints_on_schedule() {
        let script = Arc::new(Script::default());
        idle_for(&script, Some(Duration::from_millis(1)), Duration::from_millis(80));

        assert!(script.checkpoints.load(Ordering::SeqCst) >= 2);
        assert!(script.written.lock().unwrap().is_empty());
    }

    #[test]
    fn checkpoints_are_off_without_interval() {
        let script = Arc::new(Script::default());
        idle_for(&script, None, Duration::from_millis(40));
        assert_eq!(script.checkpoints.load(Ordering::SeqCst), 0);

        idle_for(&script, Some(Duration::ZERO), Duration::from_millis(40));
        assert_eq!(script.checkpoints.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn long_interval_skips_short_idle_spells() {
        let script = Arc::new(Script::default());
        idle_for(&script, Some(Duration::from_secs(3600)), Duration::from_millis(40));
        assert_eq!(script.checkpoints.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failure_after_seal_counts_as_shutdown_loss() {
        let script = Arc::new(Script::default());
        script.reject_tables.lock().unwrap().push(shared::Table::Indicators);

        let (q, rx) = dispatch_queue(None);
        q.seal();
        q.push(rows(2)).unwrap();

        let connector = FakeConnector(script.clone());
        let sink = connector.acquire().unwrap();
        let writer = BatchWriter::new(
            connector,
            sink,
            rx,
            &cfg(ExhaustedPolicy::Discard),
            Arc::new(StateCell::new(WriterState::Idle)),
            Arc::new(WriterCounters::default()),
        );
        let handle = std::thread::spawn(move || writer.run());

        // Give the writer time to fail the batch while the queue is still open.
        std::thread::sleep(Duration::from_millis(30));
        assert!(!q.is_closed());
        q.close();
        let outcome = handle.join().unwrap();

        assert_eq!((outcome.shutdown_batches, outcome.shutdown_rows), (1, 2));
    }

    #[test]
    fn failure_before_seal_is_not_a_shutdown_loss() {
        let script = Arc::new(Script::default());
        script.reject_tables.lock().unwrap().push(shared::Table::Indicators);

        let (q, rx) = dispatch_queue(None);
        q.push(rows(2)).unwrap();
        let counters = Arc::new(WriterCounters::default());
        let connector = FakeConnector(script.clone());
        let sink = connector.acquire().unwrap();
        let writer = BatchWriter::new(
            connector,
            sink,
            rx,
            &cfg(ExhaustedPolicy::Discard),
            Arc::new(StateCell::new(WriterState::Idle)),
            counters.clone(),
        );
        let handle = std::thread::spawn(move || writer.run());

        let deadline = Instant::now() + Duration::from_secs(10);
        while counters.snapshot().batches_failed == 0 {
            assert!(Instant::now() < deadline, "batch never failed");
            std::thread::sleep(Duration::from_millis(1));
        }
        q.close();
        let outcome = handle.join().unwrap();

        assert_eq!(outcome.shutdown_batches, 0);
    }

    #[test]
    fn state_cell_round_trips() {
        let cell = StateCell::new(WriterState::Idle);
        for s in [WriterState::Writing, WriterState::Retrying, WriterState::Stopped, WriterState::Idle] {
            cell.set(s);
            assert_eq!(cell.get(), s);
        }
    }
}
