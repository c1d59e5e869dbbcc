//! Test handlers for staged pipelines.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! staged-dispatch = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use staged_dispatch::testing::{EventLog, FailingHandler, RecordingHandler};
//!
//! let log = EventLog::shared();
//!
//! dispatcher
//!     .extend_one(RecordingHandler::new("audit", log.clone()))
//!     .extend_one(FailingHandler::new("validate").recording(log.clone()))
//!     .then_one(RecordingHandler::new("notify", log.clone()));
//!
//! dispatcher.start()?;
//! dispatcher.dispatch(OrderPlaced { id: 7 });
//!
//! // Wait for meaning, not time.
//! log.wait_for(3).await;
//! assert_eq!(log.handlers(), vec!["audit", "validate", "notify"]);
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;

use crate::core::{Event, Handler};

/// One handler invocation captured by an [`EventLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub handler: &'static str,
    /// `Debug` rendering of the event.
    pub event: String,
}

/// Shared, append-only record of handler invocations.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Mutex<Vec<LogEntry>>,
    notify: Notify,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log wrapped in an `Arc`, ready to hand to several handlers.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn record(&self, handler: &'static str, event: impl fmt::Debug) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LogEntry {
                handler,
                event: format!("{:?}", event),
            });
        self.notify.notify_waiters();
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Handler names in invocation order.
    pub fn handlers(&self) -> Vec<&'static str> {
        self.entries().into_iter().map(|e| e.handler).collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` invocations have been recorded.
    ///
    /// Wrap in `tokio::time::timeout` if the pipeline might never get there.
    pub async fn wait_for(&self, count: usize) {
        loop {
            // Register before checking so a record in between is not missed.
            let notified = self.notify.notified();
            if self.len() >= count {
                return;
            }
            notified.await;
        }
    }
}

/// Records every event it sees and succeeds.
#[derive(Debug, Clone)]
pub struct RecordingHandler {
    name: &'static str,
    log: Arc<EventLog>,
}

impl RecordingHandler {
    pub fn new(name: &'static str, log: Arc<EventLog>) -> Self {
        Self { name, log }
    }
}

#[async_trait]
impl<E: Event + fmt::Debug> Handler<E> for RecordingHandler {
    async fn handle(&self, event: &E) -> Result<()> {
        self.log.record(self.name, event);
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Always returns an error, optionally recording the attempt first.
#[derive(Debug, Clone)]
pub struct FailingHandler {
    name: &'static str,
    log: Option<Arc<EventLog>>,
}

impl FailingHandler {
    pub fn new(name: &'static str) -> Self {
        Self { name, log: None }
    }

    pub fn recording(mut self, log: Arc<EventLog>) -> Self {
        self.log = Some(log);
        self
    }
}

#[async_trait]
impl<E: Event + fmt::Debug> Handler<E> for FailingHandler {
    async fn handle(&self, event: &E) -> Result<()> {
        if let Some(log) = &self.log {
            log.record(self.name, event);
        }
        anyhow::bail!("{} failed on {:?}", self.name, event)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Sleeps for a fixed delay, then records the event (if a log is attached)
/// and succeeds.
#[derive(Debug, Clone)]
pub struct SlowHandler {
    name: &'static str,
    delay: Duration,
    log: Option<Arc<EventLog>>,
}

impl SlowHandler {
    pub fn new(name: &'static str, delay: Duration) -> Self {
        Self {
            name,
            delay,
            log: None,
        }
    }

    pub fn recording(mut self, log: Arc<EventLog>) -> Self {
        self.log = Some(log);
        self
    }
}

#[async_trait]
impl<E: Event + fmt::Debug> Handler<E> for SlowHandler {
    async fn handle(&self, event: &E) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        if let Some(log) = &self.log {
            log.record(self.name, event);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Panics on every event.
#[derive(Debug, Clone)]
pub struct PanickingHandler {
    name: &'static str,
}

impl PanickingHandler {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

#[async_trait]
impl<E: Event + fmt::Debug> Handler<E> for PanickingHandler {
    async fn handle(&self, event: &E) -> Result<()> {
        panic!("{} panicked on {:?}", self.name, event)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}
