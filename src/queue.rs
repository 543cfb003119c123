//! Bounded, cancellation-aware queues connecting pipeline stages.
//!
//! Each edge of the pipeline graph is one queue. Every [`Producer`] owns a
//! clone of the underlying `mpsc::Sender`, so the channel closes exactly when
//! the last producer handle is dropped. Stages hold producer handles for as
//! long as they may still push, so the closing order of the graph falls out
//! of task lifetimes instead of explicit bookkeeping at the call site.
//!
//! Producers are also counted, but only for [`Consumer::open_producers`] and
//! a debug log when the last one goes; the count never closes anything.
//!
//! Both [`Producer::push`] and [`Consumer::pull`] race against the shared
//! [`CancellationToken`], so no stage stays blocked on a queue once the run
//! has been cancelled.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue '{0}' cancelled")]
    Cancelled(&'static str),
    #[error("queue '{0}' has no consumers left")]
    Disconnected(&'static str),
}

struct Shared {
    name: &'static str,
    producers: AtomicUsize,
    cancel: CancellationToken,
}

/// Create a queue holding at most `capacity` items (at least one).
pub fn bounded<T>(
    name: &'static str,
    capacity: usize,
    cancel: CancellationToken,
) -> (Producer<T>, Consumer<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared {
        name,
        producers: AtomicUsize::new(1),
        cancel,
    });
    (
        Producer {
            tx,
            shared: Arc::clone(&shared),
        },
        Consumer {
            rx: Arc::new(Mutex::new(rx)),
            shared,
        },
    )
}

/// Sending half of a queue. Clones keep the queue open until all are dropped.
pub struct Producer<T> {
    tx: mpsc::Sender<T>,
    shared: Arc<Shared>,
}

impl<T> Producer<T> {
    /// Push one item, waiting for capacity unless the run is cancelled first.
    pub async fn push(&self, item: T) -> Result<(), QueueError> {
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => Err(QueueError::Cancelled(self.shared.name)),
            sent = self.tx.send(item) => sent.map_err(|_| QueueError::Disconnected(self.shared.name)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        self.shared.producers.fetch_add(1, Ordering::AcqRel);
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        if self.shared.producers.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug!(queue = self.shared.name, "last producer finished, closing queue");
        }
    }
}

/// Receiving half of a queue. Clones share the same receiver, so a pool of
/// workers can drain one queue.
pub struct Consumer<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
    shared: Arc<Shared>,
}

impl<T> Consumer<T> {
    /// Pull the next item.
    ///
    /// Returns `None` once the queue is closed and drained, or as soon as the
    /// run is cancelled.
    pub async fn pull(&self) -> Option<T> {
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => None,
            item = async { self.rx.lock().await.recv().await } => item,
        }
    }

    /// Number of producer handles still alive.
    pub fn open_producers(&self) -> usize {
        self.shared.producers.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }
}

impl<T> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
            shared: Arc::clone(&self.shared),
        }
    }
}
