//! Dispatcher counters.
//!
//! Handler failures never reach the caller of `dispatch`, so these counters
//! (together with the `tracing` output) are how an embedding application
//! observes what the worker did.

use serde::Serialize;

use crate::atomic::AtomicCounter;

/// Live counters shared between the facade and its worker.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub events_dispatched: AtomicCounter,
    pub events_processed: AtomicCounter,
    pub events_aborted: AtomicCounter,
    pub events_discarded: AtomicCounter,
    pub stage_failures: AtomicCounter,
    pub handler_failures: AtomicCounter,
    pub stage_timeouts: AtomicCounter,
    pub worker_starts: AtomicCounter,
}

impl Counters {
    pub fn snapshot(&self) -> DispatcherStats {
        let read = |c: &AtomicCounter| c.load_acquire().max(0) as u64;
        DispatcherStats {
            events_dispatched: read(&self.events_dispatched),
            events_processed: read(&self.events_processed),
            events_aborted: read(&self.events_aborted),
            events_discarded: read(&self.events_discarded),
            stage_failures: read(&self.stage_failures),
            handler_failures: read(&self.handler_failures),
            stage_timeouts: read(&self.stage_timeouts),
            worker_starts: read(&self.worker_starts),
        }
    }
}

/// Point-in-time copy of the dispatcher's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    /// Events accepted by `dispatch`.
    pub events_dispatched: u64,
    /// Events the worker ran through the stage pipeline, aborted or not.
    pub events_processed: u64,
    /// Events whose remaining stages were skipped after a failure.
    pub events_aborted: u64,
    /// Events still queued when the worker was cancelled.
    pub events_discarded: u64,
    /// Stages that failed (handler error, panic, or timeout).
    pub stage_failures: u64,
    /// Individual handler errors and panics.
    pub handler_failures: u64,
    /// Parallel stages that hit the stage timeout.
    pub stage_timeouts: u64,
    /// Times a worker was spawned by `start`.
    pub worker_starts: u64,
}
