//! Unbounded FIFO queue between producers and the dispatch worker.
//!
//! # Guarantees
//!
//! - **Non-blocking push**: producers never wait; the buffer grows without limit
//! - **FIFO**: a single consumer receives events in push order
//! - **In-memory only**: events are not persisted
//! - **Survives restarts**: the receiver is handed back when the worker exits,
//!   so events pushed while the dispatcher is stopped are kept for the next run
//!
//! There is no backpressure. Under sustained overload the queue's memory grows
//! until the worker catches up.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::atomic::AtomicCounter;
use crate::core::Event;

/// Create a connected sender/receiver pair.
pub(crate) fn event_queue<E: Event>() -> (EventSender<E>, EventReceiver<E>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicCounter::new(0));
    (
        EventSender {
            tx,
            depth: depth.clone(),
        },
        EventReceiver { rx, depth },
    )
}

/// Producer side of the queue. Cheap to clone.
pub(crate) struct EventSender<E: Event> {
    tx: mpsc::UnboundedSender<Arc<E>>,
    depth: Arc<AtomicCounter>,
}

impl<E: Event> EventSender<E> {
    /// Enqueue an event without waiting.
    ///
    /// Returns `false` only if the receiver has been dropped, in which case
    /// the event is lost.
    pub fn push(&self, event: E) -> bool {
        self.depth.increment();
        if self.tx.send(Arc::new(event)).is_err() {
            self.depth.decrement();
            return false;
        }
        true
    }

    /// Number of events waiting to be received.
    pub fn depth(&self) -> usize {
        self.depth.load_acquire().max(0) as usize
    }
}

impl<E: Event> Clone for EventSender<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            depth: self.depth.clone(),
        }
    }
}

impl<E: Event> fmt::Debug for EventSender<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender")
            .field("depth", &self.depth())
            .finish()
    }
}

/// Consumer side of the queue, owned by exactly one worker at a time.
pub(crate) struct EventReceiver<E: Event> {
    rx: mpsc::UnboundedReceiver<Arc<E>>,
    depth: Arc<AtomicCounter>,
}

impl<E: Event> EventReceiver<E> {
    /// Wait for the next event.
    ///
    /// Cancel safe: dropping the future before it resolves loses nothing.
    pub async fn recv(&mut self) -> Option<Arc<E>> {
        let event = self.rx.recv().await?;
        self.depth.decrement();
        Some(event)
    }

    /// Discard every event currently buffered, returning how many were dropped.
    pub fn drain(&mut self) -> usize {
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            self.depth.decrement();
            discarded += 1;
        }
        discarded
    }
}

impl<E: Event> fmt::Debug for EventReceiver<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventReceiver")
            .field("depth", &self.depth.load_acquire())
            .finish()
    }
}
