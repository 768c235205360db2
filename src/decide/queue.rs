//! Shared FIFO queue between the Filters and the Decider.
//!
//! Unbounded unless a capacity is configured; with a capacity, senders wait
//! for room, which lets a slow Decider throttle its Filters.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::InterceptorError;
use crate::model::FilteredMessage;
use crate::telemetry;

#[derive(Clone)]
enum Tx {
    Bounded(mpsc::Sender<FilteredMessage>),
    Unbounded(mpsc::UnboundedSender<FilteredMessage>),
}

enum Rx {
    Bounded(mpsc::Receiver<FilteredMessage>),
    Unbounded(mpsc::UnboundedReceiver<FilteredMessage>),
}

/// Creates the queue; `None` means unbounded.
pub fn shared_queue(capacity: Option<usize>) -> (QueueSender, QueueReceiver) {
    let depth = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (Tx::Bounded(tx), Rx::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (Tx::Unbounded(tx), Rx::Unbounded(rx))
        }
    };
    (
        QueueSender {
            tx,
            depth: depth.clone(),
        },
        QueueReceiver { rx, depth },
    )
}

#[derive(Clone)]
pub struct QueueSender {
    tx: Tx,
    depth: Arc<AtomicUsize>,
}

impl QueueSender {
    /// Enqueues `message`, waiting for room on a bounded queue.
    ///
    /// # Errors
    ///
    /// Returns `InterceptorError::QueueClosed` once the receiver is gone.
    pub async fn send(&self, message: FilteredMessage) -> Result<(), InterceptorError> {
        // Counted before the send; the guard undoes it on failure or cancel.
        let mut pending = PendingSend::new(&self.depth);
        let sent = match &self.tx {
            Tx::Bounded(tx) => tx.send(message).await.is_ok(),
            Tx::Unbounded(tx) => tx.send(message).is_ok(),
        };
        if !sent {
            return Err(InterceptorError::QueueClosed);
        }
        pending.commit();
        telemetry::record_queue_depth(self.len());
        Ok(())
    }

    /// Messages sent and not yet received.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct PendingSend<'a> {
    depth: &'a AtomicUsize,
    committed: bool,
}

impl<'a> PendingSend<'a> {
    fn new(depth: &'a AtomicUsize) -> Self {
        depth.fetch_add(1, Ordering::SeqCst);
        Self {
            depth,
            committed: false,
        }
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for PendingSend<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub struct QueueReceiver {
    rx: Rx,
    depth: Arc<AtomicUsize>,
}

impl QueueReceiver {
    /// Waits for the next message; `None` once every sender is dropped.
    ///
    /// The message keeps counting toward [`QueueReceiver::len`] until the
    /// returned [`Dequeued`] is dropped, so a consumer can hand it off before
    /// the queue reports empty.
    pub async fn recv(&mut self) -> Option<Dequeued> {
        let message = match &mut self.rx {
            Rx::Bounded(rx) => rx.recv().await,
            Rx::Unbounded(rx) => rx.recv().await,
        }?;
        Some(Dequeued {
            message,
            depth: self.depth.clone(),
        })
    }

    /// Removes every queued message without processing it.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        loop {
            let next = match &mut self.rx {
                Rx::Bounded(rx) => rx.try_recv().ok(),
                Rx::Unbounded(rx) => rx.try_recv().ok(),
            };
            match next {
                Some(_) => {
                    self.decrement();
                    drained += 1;
                }
                None => return drained,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn decrement(&self) {
        decrement(&self.depth);
    }
}

fn decrement(depth: &AtomicUsize) {
    let _ = depth.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1));
}

/// A received message that is still in flight.
pub struct Dequeued {
    message: FilteredMessage,
    depth: Arc<AtomicUsize>,
}

impl Dequeued {
    pub fn message(&self) -> &FilteredMessage {
        &self.message
    }
}

impl Deref for Dequeued {
    type Target = FilteredMessage;

    fn deref(&self) -> &FilteredMessage {
        &self.message
    }
}

impl Drop for Dequeued {
    fn drop(&mut self) {
        decrement(&self.depth);
    }
}
