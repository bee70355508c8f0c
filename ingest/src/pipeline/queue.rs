//! Dispatch queue
//! ==============
//! Hand-off between producer accumulators and the single batch writer.
//!
//! Shutdown is a two-step gate:
//!   • **seal**  → accumulators stop taking records but may still submit
//!     their last partial batch;
//!   • **close** → every push is refused and the writer drains what is left.
//!
//! `close` takes the gate's write lock, so it waits for pushes already in
//! flight. Once it returns, nothing can enter the channel and an empty
//! channel means the writer is done.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
    time::Duration,
};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use thiserror::Error;

use super::batch::Batch;

#[derive(Debug, Error)]
pub enum PushError {
    #[error("dispatch queue closed, {} rows for {} refused", .0.len(), .0.table())]
    Closed(Batch),

    #[error("batch writer is gone, {} rows for {} refused", .0.len(), .0.table())]
    Disconnected(Batch),
}

impl PushError {
    pub fn into_batch(self) -> Batch {
        match self {
            PushError::Closed(b) | PushError::Disconnected(b) => b,
        }
    }
}

/// Result of one [`DispatchReceiver::pop`].
#[derive(Debug)]
pub enum Pop {
    Batch(Batch),
    /// Nothing arrived within the timeout; the queue is still open.
    Timeout,
    /// Closed and empty: no batch will ever arrive again.
    Drained,
}

struct Gate {
    tx:       Sender<Batch>,
    sealed:   Arc<AtomicBool>,
    closed:   RwLock<bool>,
    shutdown: Mutex<Option<Sender<()>>>,
}

/// Producer side; cheap to clone.
#[derive(Clone)]
pub struct DispatchQueue {
    gate: Arc<Gate>,
}

/// Writer side.
pub struct DispatchReceiver {
    rx:       Receiver<Batch>,
    sealed:   Arc<AtomicBool>,
    shutdown: Receiver<()>,
}

/// `None` keeps the queue unbounded; `Some(n)` makes `push` block while `n`
/// batches are waiting.
pub fn dispatch_queue(capacity: Option<usize>) -> (DispatchQueue, DispatchReceiver) {
    let (tx, rx) = match capacity {
        Some(n) => channel::bounded(n.max(1)),
        None => channel::unbounded(),
    };
    let (shutdown_tx, shutdown_rx) = channel::bounded(0);
    let sealed = Arc::new(AtomicBool::new(false));

    let gate = Arc::new(Gate {
        tx,
        sealed: Arc::clone(&sealed),
        closed: RwLock::new(false),
        shutdown: Mutex::new(Some(shutdown_tx)),
    });
    (DispatchQueue { gate }, DispatchReceiver { rx, sealed, shutdown: shutdown_rx })
}

impl DispatchQueue {
    /// Hand a batch to the writer. Blocks only on a full bounded queue.
    pub fn push(&self, batch: Batch) -> Result<(), PushError> {
        let closed = self.gate.closed.read().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return Err(PushError::Closed(batch));
        }
        self.gate
            .tx
            .send(batch)
            .map_err(|channel::SendError(b)| PushError::Disconnected(b))?;
        metrics::gauge!("ingest_queue_depth").set(self.gate.tx.len() as f64);
        Ok(())
    }

    /// Stop accepting new records; pending partial batches may still be pushed.
    pub fn seal(&self) {
        self.gate.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        !self.gate.sealed.load(Ordering::SeqCst)
    }

    /// Refuse every further push and wake the writer for its final drain.
    pub fn close(&self) {
        self.seal();
        let mut closed = self.gate.closed.write().unwrap_or_else(PoisonError::into_inner);
        *closed = true;
        self.gate
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_closed(&self) -> bool {
        *self.gate.closed.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Batches waiting for the writer.
    pub fn len(&self) -> usize {
        self.gate.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gate.tx.is_empty()
    }
}

impl DispatchReceiver {
    /// Next batch in push order, or `Timeout` so the caller can do idle work.
    pub fn pop(&self, timeout: Duration) -> Pop {
        crossbeam::select! {
            recv(self.rx) -> msg => match msg {
                Ok(batch) => Pop::Batch(batch),
                Err(_) => Pop::Drained,
            },
            recv(self.shutdown) -> _ => match self.rx.try_recv() {
                Ok(batch) => Pop::Batch(batch),
                Err(_) => Pop::Drained,
            },
            default(timeout) => Pop::Timeout,
        }
    }

    /// `true` once shutdown has begun, i.e. after [`DispatchQueue::seal`] or
    /// [`DispatchQueue::close`]. Every batch still to come is a final flush.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// `true` once the producer side has called [`DispatchQueue::close`].
    pub fn is_closed(&self) -> bool {
        matches!(self.shutdown.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
