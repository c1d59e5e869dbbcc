//! The dispatcher facade: registration, submission, and worker lifecycle.
//!
//! ```text
//!            start() ── CAS false → true ──┐
//!   ┌─────────┐                            ▼   ┌─────────┐
//!   │ Stopped │                                │ Running │
//!   └─────────┘ ◄── shutdown() ── cancel+join ─└─────────┘
//! ```
//!
//! - Registration (`extend`, `then`) only takes effect while stopped.
//! - `dispatch` works in both states; events queued while stopped are
//!   delivered once the worker starts.
//! - `shutdown` is the only call that waits.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::atomic::AtomicFlag;
use crate::config::DispatcherConfig;
use crate::core::{Event, Handler, HandlerRef};
use crate::error::{panic_message, ConfigError, DispatchError};
use crate::queue::{event_queue, EventReceiver, EventSender};
use crate::stage::StageTable;
use crate::stats::{Counters, DispatcherStats};
use crate::worker::DispatchWorker;

/// A running worker: its cancellation handle and join handle.
struct WorkerSlot {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Staged event dispatcher.
///
/// Owns the stage table, the event queue, the run state, and the current
/// worker. Share it behind an `Arc` to dispatch from many tasks or threads.
///
/// # Example
///
/// ```ignore
/// let dispatcher = Dispatcher::new(DispatcherConfig::parallel(500))?;
///
/// dispatcher
///     .extend_one(ValidateOrder)
///     .extend_one(ReserveStock)
///     .then_one(SendConfirmation);
///
/// dispatcher.start()?;
/// dispatcher.dispatch(OrderPlaced { order_id });
///
/// // Later, during teardown:
/// dispatcher.shutdown().await?;
/// ```
pub struct Dispatcher<E: Event> {
    config: DispatcherConfig,
    running: AtomicFlag,
    stages: Mutex<StageTable<E>>,
    sender: EventSender<E>,
    receiver: Arc<tokio::sync::Mutex<EventReceiver<E>>>,
    worker: Mutex<Option<WorkerSlot>>,
    counters: Arc<Counters>,
}

impl<E: Event> Dispatcher<E> {
    /// Create a stopped dispatcher with an empty stage table.
    pub fn new(config: DispatcherConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (sender, receiver) = event_queue();
        Ok(Self {
            config,
            running: AtomicFlag::new(false),
            stages: Mutex::new(StageTable::new()),
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            worker: Mutex::new(None),
            counters: Arc::new(Counters::default()),
        })
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Append handlers to the current last stage (stage 1 if there is none).
    ///
    /// Ignored while the dispatcher is running.
    pub fn extend<I>(&self, handlers: I) -> &Self
    where
        I: IntoIterator<Item = HandlerRef<E>>,
    {
        let mut table = lock(&self.stages);
        if self.running.load_acquire() {
            debug!(dispatcher = %self.config.name, "dispatcher running, extend ignored");
            return self;
        }
        table.extend(handlers);
        self
    }

    /// Open a new stage containing `handlers`.
    ///
    /// Ignored while the dispatcher is running.
    pub fn then<I>(&self, handlers: I) -> &Self
    where
        I: IntoIterator<Item = HandlerRef<E>>,
    {
        let mut table = lock(&self.stages);
        if self.running.load_acquire() {
            debug!(dispatcher = %self.config.name, "dispatcher running, then ignored");
            return self;
        }
        table.then(handlers);
        self
    }

    /// [`extend`](Self::extend) with a single handler.
    pub fn extend_one<H: Handler<E>>(&self, handler: H) -> &Self {
        self.extend([Arc::new(handler) as HandlerRef<E>])
    }

    /// [`then`](Self::then) with a single handler.
    pub fn then_one<H: Handler<E>>(&self, handler: H) -> &Self {
        self.then([Arc::new(handler) as HandlerRef<E>])
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn the dispatch worker if the dispatcher is stopped.
    ///
    /// Calling `start` on a running dispatcher does nothing. The cancellation
    /// handle is installed before this returns, under the same lock that
    /// `shutdown` takes, so a concurrent `shutdown` always finds it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<&Self, DispatchError> {
        let runtime = Handle::try_current().map_err(|_| DispatchError::NoRuntime {
            name: self.config.name.clone(),
        })?;

        let mut slot = lock(&self.worker);
        if !self.running.compare_and_swap(true, false) {
            debug!(dispatcher = %self.config.name, "dispatcher already running");
            return Ok(self);
        }

        let cancel = CancellationToken::new();
        let stages = lock(&self.stages).snapshot();
        let worker = DispatchWorker::new(&self.config, stages, self.counters.clone());
        let join = runtime.spawn(worker.run(self.receiver.clone(), cancel.clone()));
        *slot = Some(WorkerSlot { cancel, join });

        let starts = self.counters.worker_starts.increment();
        info!(
            dispatcher = %self.config.name,
            run = starts,
            queued = self.sender.depth(),
            "dispatcher started"
        );
        Ok(self)
    }

    /// Stop the worker and wait for it to exit.
    ///
    /// Does nothing if the dispatcher is stopped. Otherwise the worker finishes
    /// the event it is processing (including any parallel-stage timeout),
    /// discards whatever is still queued, and exits.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        let slot = {
            let mut slot = lock(&self.worker);
            if !self.running.compare_and_swap(false, true) {
                return Ok(());
            }
            slot.take()
        };

        let Some(WorkerSlot { cancel, join }) = slot else {
            return Ok(());
        };

        info!(dispatcher = %self.config.name, "dispatcher shutting down");
        cancel.cancel();

        match join.await {
            Ok(()) => {
                info!(dispatcher = %self.config.name, "dispatcher stopped");
                Ok(())
            }
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic().as_ref());
                error!(dispatcher = %self.config.name, panic = %message, "dispatch worker panicked");
                Err(DispatchError::WorkerPanicked { message })
            }
            Err(e) => {
                warn!(dispatcher = %self.config.name, error = %e, "dispatch worker was cancelled");
                Ok(())
            }
        }
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Enqueue an event for the worker. Never waits.
    ///
    /// Fire-and-forget: there is no acknowledgement and handler failures are
    /// not reported back here.
    pub fn dispatch(&self, event: E) {
        if self.sender.push(event) {
            self.counters.events_dispatched.increment();
        } else {
            warn!(dispatcher = %self.config.name, "event queue closed, event dropped");
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Whether a worker is currently consuming the queue.
    pub fn is_running(&self) -> bool {
        self.running.load_acquire()
    }

    /// The configuration this dispatcher was built with.
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Number of registered stages.
    pub fn stage_count(&self) -> usize {
        lock(&self.stages).len()
    }

    /// Number of registered handlers across all stages.
    pub fn handler_count(&self) -> usize {
        lock(&self.stages).handler_count()
    }

    /// Events waiting in the queue.
    pub fn queue_depth(&self) -> usize {
        self.sender.depth()
    }

    /// Snapshot of the dispatcher's counters.
    pub fn stats(&self) -> DispatcherStats {
        self.counters.snapshot()
    }
}

impl<E: Event> Drop for Dispatcher<E> {
    fn drop(&mut self) {
        let slot = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(WorkerSlot { cancel, .. }) = slot {
            self.running.store_fenced(false);
            cancel.cancel();
            debug!(dispatcher = %self.config.name, "dispatcher dropped while running, worker cancelled");
        }
    }
}

impl<E: Event> fmt::Debug for Dispatcher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.config.name)
            .field("mode", &self.config.mode)
            .field("running", &self.is_running())
            .field("stage_count", &self.stage_count())
            .field("queue_depth", &self.queue_depth())
            .finish_non_exhaustive()
    }
}

/// Lock a mutex, recovering the guard if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
