//! Ordered stages of handlers.
//!
//! A [`StageTable`] is built before the dispatcher starts and frozen into an
//! `Arc<[Stage<E>]>` snapshot when it does. The worker only ever iterates it
//! front to back, so stages live in a plain `Vec` whose index is the sequence
//! number minus one.
//!
//! ```text
//! extend(A).extend(B).then(C).then(D, E)
//!
//!   stage 1: [A, B]
//!   stage 2: [C]
//!   stage 3: [D, E]
//! ```

use std::fmt;
use std::sync::Arc;

use crate::core::{Event, HandlerRef};

/// One step of the pipeline: handlers that run together before the next
/// stage begins.
pub struct Stage<E: Event> {
    sequence: usize,
    handlers: Vec<HandlerRef<E>>,
}

impl<E: Event> Stage<E> {
    fn new(sequence: usize) -> Self {
        Self {
            sequence,
            handlers: Vec::new(),
        }
    }

    /// Sequence number, starting at 1.
    pub fn sequence(&self) -> usize {
        self.sequence
    }

    /// Handlers in registration order.
    pub fn handlers(&self) -> &[HandlerRef<E>] {
        &self.handlers
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<E: Event> Clone for Stage<E> {
    fn clone(&self) -> Self {
        Self {
            sequence: self.sequence,
            handlers: self.handlers.clone(),
        }
    }
}

impl<E: Event> fmt::Debug for Stage<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&'static str> = self.handlers.iter().map(|h| h.name()).collect();
        f.debug_struct("Stage")
            .field("sequence", &self.sequence)
            .field("handlers", &names)
            .finish()
    }
}

/// The ordered collection of stages.
///
/// Sequence numbers are dense: stage `n` always sits at index `n - 1`.
pub struct StageTable<E: Event> {
    stages: Vec<Stage<E>>,
}

impl<E: Event> StageTable<E> {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Append handlers to the highest-numbered stage, creating stage 1 if the
    /// table is empty.
    pub fn extend<I>(&mut self, handlers: I)
    where
        I: IntoIterator<Item = HandlerRef<E>>,
    {
        if self.stages.is_empty() {
            self.stages.push(Stage::new(1));
        }
        if let Some(last) = self.stages.last_mut() {
            last.handlers.extend(handlers);
        }
    }

    /// Open a new stage numbered one past the current maximum.
    pub fn then<I>(&mut self, handlers: I)
    where
        I: IntoIterator<Item = HandlerRef<E>>,
    {
        let mut stage = Stage::new(self.stages.len() + 1);
        stage.handlers.extend(handlers);
        self.stages.push(stage);
    }

    pub fn stages(&self) -> &[Stage<E>] {
        &self.stages
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Total number of handlers across all stages.
    pub fn handler_count(&self) -> usize {
        self.stages.iter().map(Stage::len).sum()
    }

    /// Freeze the current stages into an immutable snapshot.
    pub fn snapshot(&self) -> Arc<[Stage<E>]> {
        self.stages.iter().cloned().collect()
    }
}

impl<E: Event> Default for StageTable<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> fmt::Debug for StageTable<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageTable")
            .field("stages", &self.stages)
            .finish()
    }
}
