//! The dispatch worker: a single task that drains the queue and runs stages.
//!
//! ```text
//! loop {
//!   ├─► select (biased)
//!   │     ├─ cancelled ─► drain queue (discard), exit
//!   │     └─ event     ─► process(event)
//!   │
//!   └─ process(event):
//!        for stage in 1..=N {
//!          ├─ Parallel:   spawn one task per handler, wait ≤ stage_timeout
//!          └─ Sequential: await handlers one by one on this task
//!
//!          on failure:
//!            ├─ break_on_exception = true  ─► skip remaining stages
//!            └─ break_on_exception = false ─► log, continue
//!        }
//! }
//! ```
//!
//! Cancellation is only observed between events. A stage that has started
//! always runs to completion or to its timeout.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use futures::future::join_all;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{DispatchMode, DispatcherConfig};
use crate::core::{Event, HandlerRef};
use crate::error::{panic_message, StageFailure};
use crate::queue::EventReceiver;
use crate::stage::Stage;
use crate::stats::Counters;

pub(crate) struct DispatchWorker<E: Event> {
    name: String,
    stages: Arc<[Stage<E>]>,
    mode: DispatchMode,
    break_on_exception: bool,
    stage_timeout: Duration,
    counters: Arc<Counters>,
}

impl<E: Event> DispatchWorker<E> {
    pub fn new(config: &DispatcherConfig, stages: Arc<[Stage<E>]>, counters: Arc<Counters>) -> Self {
        Self {
            name: config.name.clone(),
            stages,
            mode: config.mode,
            break_on_exception: config.break_on_exception,
            stage_timeout: config.stage_timeout(),
            counters,
        }
    }

    /// Run until `cancel` fires.
    ///
    /// The queue lock is held for the worker's whole life, so a worker spawned
    /// by a quick restart waits here until the previous one has exited.
    pub async fn run(self, queue: Arc<Mutex<EventReceiver<E>>>, cancel: CancellationToken) {
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            guard = queue.clone().lock_owned() => Some(guard),
        };

        let Some(mut receiver) = acquired else {
            // Stopped before it ever ran. If no earlier worker still owns
            // the queue, the discard falls to us.
            if let Ok(mut receiver) = queue.try_lock_owned() {
                self.discard(&mut receiver);
            }
            return;
        };

        info!(
            dispatcher = %self.name,
            mode = %self.mode,
            stages = self.stages.len(),
            break_on_exception = self.break_on_exception,
            "dispatch worker starting"
        );

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = receiver.recv() => match event {
                    Some(event) => event,
                    None => {
                        warn!(dispatcher = %self.name, "event queue closed");
                        break;
                    }
                },
            };

            self.process(event).await;
        }

        self.discard(&mut receiver);
        info!(dispatcher = %self.name, "dispatch worker stopped");
    }

    fn discard(&self, queue: &mut EventReceiver<E>) {
        let discarded = queue.drain();
        if discarded > 0 {
            self.counters.events_discarded.add(discarded as i64);
            info!(dispatcher = %self.name, discarded, "discarded queued events on shutdown");
        }
    }

    /// Run every stage against one event.
    async fn process(&self, event: Arc<E>) {
        let started = Instant::now();
        let mut aborted = false;

        for stage in self.stages.iter() {
            let result = match self.mode {
                DispatchMode::Parallel => self.run_parallel(stage, &event).await,
                DispatchMode::Sequential => self.run_sequential(stage, &event).await,
            };

            let Err(failure) = result else {
                trace!(dispatcher = %self.name, stage = stage.sequence(), "stage complete");
                continue;
            };

            self.counters.stage_failures.increment();
            if self.break_on_exception {
                warn!(
                    dispatcher = %self.name,
                    error = %failure,
                    skipped = self.stages.len() - stage.sequence(),
                    "stage failed, skipping remaining stages for this event"
                );
                aborted = true;
                break;
            }
            warn!(dispatcher = %self.name, error = %failure, "stage failed, continuing");
        }

        if aborted {
            self.counters.events_aborted.increment();
        }
        self.counters.events_processed.increment();
        debug!(
            dispatcher = %self.name,
            aborted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "event processed"
        );
    }

    /// Await handlers one at a time on the worker task.
    ///
    /// Reports the first failure. With `break_on_exception` the rest of the
    /// stage is skipped as well.
    async fn run_sequential(&self, stage: &Stage<E>, event: &E) -> Result<(), StageFailure> {
        let mut first_failure = None;

        for handler in stage.handlers() {
            let Err(source) = invoke(handler, event).await else {
                continue;
            };

            let failure = self.handler_failed(stage.sequence(), handler.name(), source);
            if self.break_on_exception {
                return Err(failure);
            }
            if first_failure.is_none() {
                first_failure = Some(failure);
            }
        }

        match first_failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    /// Spawn one task per handler and wait for all of them, at most
    /// `stage_timeout`.
    ///
    /// On timeout the remaining tasks keep running detached; only the wait is
    /// bounded.
    async fn run_parallel(&self, stage: &Stage<E>, event: &Arc<E>) -> Result<(), StageFailure> {
        if stage.is_empty() {
            return Ok(());
        }

        let mut tasks: Vec<(&'static str, JoinHandle<anyhow::Result<()>>)> = stage
            .handlers()
            .iter()
            .map(|handler| {
                let handler = handler.clone();
                let event = event.clone();
                let name = handler.name();
                let task = tokio::spawn(async move { handler.handle(&event).await });
                (name, task)
            })
            .collect();

        let joined = tokio::time::timeout(
            self.stage_timeout,
            join_all(tasks.iter_mut().map(|(_, task)| task)),
        )
        .await;

        let results = match joined {
            Ok(results) => results,
            Err(_) => {
                let pending = tasks.iter().filter(|(_, task)| !task.is_finished()).count();
                self.counters.stage_timeouts.increment();
                // Dropping the handles detaches the stragglers.
                return Err(StageFailure::Timeout {
                    stage: stage.sequence(),
                    timeout: self.stage_timeout,
                    pending,
                });
            }
        };

        let mut first_failure = None;
        for ((name, _), result) in tasks.iter().zip(results) {
            let source = match result {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(join_err) if join_err.is_panic() => {
                    anyhow!("handler panicked: {}", panic_message(join_err.into_panic().as_ref()))
                }
                Err(join_err) => anyhow!("handler task did not complete: {}", join_err),
            };
            let failure = self.handler_failed(stage.sequence(), *name, source);
            if first_failure.is_none() {
                first_failure = Some(failure);
            }
        }

        match first_failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn handler_failed(
        &self,
        stage: usize,
        handler: &'static str,
        source: anyhow::Error,
    ) -> StageFailure {
        self.counters.handler_failures.increment();
        debug!(
            dispatcher = %self.name,
            stage,
            handler,
            error = %source,
            "handler failed"
        );
        StageFailure::HandlerFailed {
            stage,
            handler,
            source,
        }
    }
}

/// Run a handler on the current task, turning a panic into an error.
async fn invoke<E: Event>(handler: &HandlerRef<E>, event: &E) -> anyhow::Result<()> {
    // AssertUnwindSafe is required because the handler is not UnwindSafe
    match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow!("handler panicked: {}", panic_message(panic.as_ref()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HandlerFn;
    use crate::queue::event_queue;
    use crate::stage::StageTable;
    use crate::testing::{PanickingHandler, SlowHandler};
    use std::sync::Mutex as StdMutex;

    #[derive(Debug)]
    struct TestEvent(u32);

    type Log = Arc<StdMutex<Vec<String>>>;

    fn recorder(log: &Log, tag: &'static str) -> HandlerRef<TestEvent> {
        let log = log.clone();
        HandlerFn::arc(tag, move |event: &TestEvent| {
            log.lock().unwrap().push(format!("{}:{}", tag, event.0));
            Ok(())
        })
    }

    fn failing(log: &Log, tag: &'static str) -> HandlerRef<TestEvent> {
        let log = log.clone();
        HandlerFn::arc(tag, move |event: &TestEvent| {
            log.lock().unwrap().push(format!("{}:{}", tag, event.0));
            anyhow::bail!("{} failed", tag)
        })
    }

    fn worker(
        config: DispatcherConfig,
        table: &StageTable<TestEvent>,
    ) -> (DispatchWorker<TestEvent>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (
            DispatchWorker::new(&config, table.snapshot(), counters.clone()),
            counters,
        )
    }

    #[tokio::test]
    async fn test_sequential_runs_in_registration_order() {
        let log = Log::default();
        let mut table = StageTable::new();
        table.extend([recorder(&log, "a"), recorder(&log, "b")]);
        table.then([recorder(&log, "c")]);

        let (worker, counters) = worker(DispatcherConfig::sequential(), &table);
        worker.process(Arc::new(TestEvent(1))).await;

        assert_eq!(*log.lock().unwrap(), vec!["a:1", "b:1", "c:1"]);
        assert_eq!(counters.events_processed.load(), 1);
        assert_eq!(counters.stage_failures.load(), 0);
    }

    #[tokio::test]
    async fn test_sequential_break_skips_rest_of_stage_and_later_stages() {
        let log = Log::default();
        let mut table = StageTable::new();
        table.extend([failing(&log, "a"), recorder(&log, "b")]);
        table.then([recorder(&log, "c")]);

        let config = DispatcherConfig::sequential().with_break_on_exception(true);
        let (worker, counters) = worker(config, &table);
        worker.process(Arc::new(TestEvent(1))).await;

        assert_eq!(*log.lock().unwrap(), vec!["a:1"]);
        assert_eq!(counters.events_aborted.load(), 1);
        assert_eq!(counters.handler_failures.load(), 1);
    }

    #[tokio::test]
    async fn test_sequential_without_break_runs_everything() {
        let log = Log::default();
        let mut table = StageTable::new();
        table.extend([failing(&log, "a"), failing(&log, "b")]);
        table.then([recorder(&log, "c")]);

        let (worker, counters) = worker(DispatcherConfig::sequential(), &table);
        worker.process(Arc::new(TestEvent(7))).await;

        assert_eq!(*log.lock().unwrap(), vec!["a:7", "b:7", "c:7"]);
        assert_eq!(counters.handler_failures.load(), 2);
        assert_eq!(counters.stage_failures.load(), 1);
        assert_eq!(counters.events_aborted.load(), 0);
    }

    #[tokio::test]
    async fn test_sequential_panic_is_a_handler_failure() {
        let log = Log::default();
        let mut table = StageTable::new();
        table.extend([Arc::new(PanickingHandler::new("boom")) as HandlerRef<TestEvent>]);
        table.then([recorder(&log, "after")]);

        let (worker, counters) = worker(DispatcherConfig::sequential(), &table);
        let result = worker.run_sequential(&worker.stages[0], &TestEvent(1)).await;

        match result {
            Err(StageFailure::HandlerFailed { stage, source, .. }) => {
                assert_eq!(stage, 1);
                assert!(source.to_string().contains("boom"));
            }
            other => panic!("expected HandlerFailed, got {:?}", other),
        }

        worker.process(Arc::new(TestEvent(2))).await;
        assert_eq!(*log.lock().unwrap(), vec!["after:2"]);
        assert_eq!(counters.handler_failures.load(), 2);
    }

    #[tokio::test]
    async fn test_parallel_stage_reports_handler_failure() {
        let log = Log::default();
        let mut table = StageTable::new();
        table.extend([failing(&log, "a"), recorder(&log, "b")]);

        let (worker, _counters) = worker(DispatcherConfig::parallel(1_000), &table);
        let result = worker
            .run_parallel(&worker.stages[0], &Arc::new(TestEvent(3)))
            .await;

        assert!(matches!(result, Err(StageFailure::HandlerFailed { stage: 1, handler: "a", .. })));
        let mut entries = log.lock().unwrap().clone();
        entries.sort();
        assert_eq!(entries, vec!["a:3", "b:3"]);
    }

    #[tokio::test]
    async fn test_parallel_panic_is_a_handler_failure() {
        let mut table = StageTable::new();
        table.extend([Arc::new(PanickingHandler::new("boom")) as HandlerRef<TestEvent>]);

        let (worker, counters) = worker(DispatcherConfig::parallel(1_000), &table);
        let result = worker
            .run_parallel(&worker.stages[0], &Arc::new(TestEvent(1)))
            .await;

        match result {
            Err(StageFailure::HandlerFailed { source, .. }) => {
                assert!(source.to_string().contains("panicked"));
            }
            other => panic!("expected HandlerFailed, got {:?}", other),
        }
        assert_eq!(counters.handler_failures.load(), 1);
    }

    #[tokio::test]
    async fn test_parallel_timeout_bounds_the_wait() {
        let mut table = StageTable::new();
        table.extend([
            Arc::new(SlowHandler::new("slow", Duration::from_millis(500))) as HandlerRef<TestEvent>,
            Arc::new(SlowHandler::new("quick", Duration::from_millis(1))),
        ]);

        let (worker, counters) = worker(DispatcherConfig::parallel(50), &table);
        let started = Instant::now();
        let result = worker
            .run_parallel(&worker.stages[0], &Arc::new(TestEvent(1)))
            .await;
        let elapsed = started.elapsed();

        match result {
            Err(StageFailure::Timeout { pending, timeout, .. }) => {
                assert_eq!(pending, 1);
                assert_eq!(timeout, Duration::from_millis(50));
            }
            other => panic!("expected Timeout, got {:?}", other),
        }
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(400), "waited {:?}", elapsed);
        assert_eq!(counters.stage_timeouts.load(), 1);
    }

    #[tokio::test]
    async fn test_empty_stage_succeeds() {
        let mut table = StageTable::<TestEvent>::new();
        table.then(Vec::new());

        let (worker, _) = worker(DispatcherConfig::parallel(10), &table);
        assert!(worker
            .run_parallel(&worker.stages[0], &Arc::new(TestEvent(1)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_discards_without_processing() {
        let log = Log::default();
        let mut table = StageTable::new();
        table.extend([recorder(&log, "a")]);

        let (tx, rx) = event_queue();
        tx.push(TestEvent(1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (w, counters) = worker(DispatcherConfig::sequential(), &table);
        w.run(Arc::new(Mutex::new(rx)), cancel).await;

        assert_eq!(tx.depth(), 0);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(counters.events_discarded.load(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_while_queue_is_held_leaves_it_alone() {
        let table = StageTable::<TestEvent>::new();
        let (tx, rx) = event_queue();
        tx.push(TestEvent(1));

        let queue = Arc::new(Mutex::new(rx));
        let held = queue.clone().lock_owned().await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (w, counters) = worker(DispatcherConfig::sequential(), &table);
        w.run(queue, cancel).await;

        assert_eq!(tx.depth(), 1);
        assert_eq!(counters.events_discarded.load(), 0);
        drop(held);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_queue_then_release() {
        let table = StageTable::<TestEvent>::new();
        let (tx, rx) = event_queue();
        tx.push(TestEvent(1));

        let queue = Arc::new(Mutex::new(rx));
        let held = queue.clone().lock_owned().await;

        let (w, counters) = worker(DispatcherConfig::sequential(), &table);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(w.run(queue.clone(), cancel.clone()));

        // The worker is parked on the held queue when it is cancelled.
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        drop(held);
        handle.await.unwrap();

        // Nothing processed, and the queue is free for the next worker.
        assert_eq!(counters.events_processed.load(), 0);
        assert_eq!(
            counters.events_discarded.load() + tx.depth() as i64,
            1
        );
        assert!(queue.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_waiting_worker_takes_over_released_queue() {
        let log = Log::default();
        let mut table = StageTable::new();
        table.extend([recorder(&log, "next")]);

        let (tx, rx) = event_queue();
        tx.push(TestEvent(5));

        let queue = Arc::new(Mutex::new(rx));
        let held = queue.clone().lock_owned().await;

        let (w, counters) = worker(DispatcherConfig::sequential(), &table);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(w.run(queue, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(log.lock().unwrap().is_empty());

        drop(held);
        let deadline = Instant::now() + Duration::from_secs(5);
        while counters.events_processed.load() < 1 {
            assert!(Instant::now() < deadline, "worker never took over the queue");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["next:5"]);
    }

    #[tokio::test]
    async fn test_cancel_finishes_current_event_then_discards_the_rest() {
        let mut table = StageTable::new();
        table.extend([
            Arc::new(SlowHandler::new("slow", Duration::from_millis(100))) as HandlerRef<TestEvent>,
        ]);

        let (tx, rx) = event_queue();
        for i in 0..3 {
            tx.push(TestEvent(i));
        }

        let (w, counters) = worker(DispatcherConfig::sequential(), &table);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(w.run(Arc::new(Mutex::new(rx)), cancel.clone()));

        // Let the worker pick up the first event, then cancel mid-stage.
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(counters.events_processed.load(), 1);
        assert_eq!(counters.events_discarded.load(), 2);
        assert_eq!(tx.depth(), 0);
    }
}
