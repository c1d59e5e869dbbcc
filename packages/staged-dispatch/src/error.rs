//! Structured error types for the dispatcher.
//!
//! - [`StageFailure`] classifies what went wrong while running one stage.
//!   It never leaves the worker: failures are logged, counted, and resolved
//!   according to `break_on_exception`.
//! - [`DispatchError`] covers lifecycle problems surfaced to the caller.
//! - [`ConfigError`] rejects invalid [`DispatcherConfig`](crate::DispatcherConfig) values.
//! - [`FlagError`] rejects non-canonical [`AtomicFlag`](crate::AtomicFlag) encodings.
//!
//! # The Failure Boundary Rule
//!
//! > **No handler error ever reaches the caller of `dispatch`.**
//!
//! Handlers return `anyhow::Result<()>` for ergonomics. The worker wraps
//! failures in [`StageFailure`] at the stage boundary, and observability is
//! through logs and [`DispatcherStats`](crate::DispatcherStats) only.

use std::time::Duration;

use thiserror::Error;

// =============================================================================
// Stage Failure
// =============================================================================

/// Why a stage did not complete cleanly.
#[derive(Debug, Error)]
pub enum StageFailure {
    /// A handler returned an error or panicked.
    #[error("handler {handler} failed in stage {stage}: {source}")]
    HandlerFailed {
        /// Sequence number of the stage (starting at 1).
        stage: usize,
        /// Name of the failing handler.
        handler: &'static str,
        /// The error the handler returned.
        #[source]
        source: anyhow::Error,
    },

    /// A parallel stage did not finish within the configured timeout.
    #[error("stage {stage} timed out after {timeout:?} with {pending} handler(s) still running")]
    Timeout {
        /// Sequence number of the stage (starting at 1).
        stage: usize,
        /// The configured stage timeout.
        timeout: Duration,
        /// Handlers that had not finished when the wait ended.
        pending: usize,
    },
}

impl StageFailure {
    /// Sequence number of the stage that failed.
    pub fn stage(&self) -> usize {
        match self {
            StageFailure::HandlerFailed { stage, .. } | StageFailure::Timeout { stage, .. } => {
                *stage
            }
        }
    }

    /// Returns true if the stage timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StageFailure::Timeout { .. })
    }
}

// =============================================================================
// Dispatch Error
// =============================================================================

/// Lifecycle errors surfaced by the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// `start` was called outside a tokio runtime.
    #[error("dispatcher {name} cannot start outside a tokio runtime")]
    NoRuntime {
        /// Configured dispatcher name.
        name: String,
    },

    /// The worker task panicked instead of exiting cleanly.
    #[error("dispatch worker panicked: {message}")]
    WorkerPanicked {
        /// Extracted panic payload.
        message: String,
    },
}

// =============================================================================
// Config Error
// =============================================================================

/// Invalid dispatcher configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Parallel mode needs a positive stage timeout.
    #[error("stage_timeout_ms must be greater than zero in parallel mode")]
    ZeroTimeout,

    /// The dispatch mode string is not recognised.
    #[error("unknown dispatch mode {value:?} (expected \"parallel\" or \"sequential\")")]
    InvalidMode {
        /// The rejected input.
        value: String,
    },
}

// =============================================================================
// Flag Error
// =============================================================================

/// Invalid raw encoding for an atomic flag.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlagError {
    #[error("atomic flag encoding must be 0 or 1, got {raw:#04x}")]
    NonCanonical { raw: u8 },
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
