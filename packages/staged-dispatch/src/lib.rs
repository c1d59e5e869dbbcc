//! # Staged Dispatch
//!
//! An in-process event dispatcher that runs ordered **stages** of handlers on
//! a single background worker.
//!
//! ## Core Concepts
//!
//! - [`Event`] = any `Send + Sync + 'static` value
//! - [`Handler`] = async callback invoked with a shared reference to an event
//! - **Stage** = a group of handlers that all finish before the next stage begins
//! - [`Dispatcher`] = owns the stages, the queue, and the worker lifecycle
//!
//! Producers call [`Dispatcher::dispatch`] and return immediately. One worker
//! pulls events in FIFO order and pushes each through every stage.
//!
//! ## Architecture
//!
//! ```text
//! Producers (any task or thread)
//!     │
//!     ▼ dispatch()
//! EventQueue (unbounded, FIFO) ───────────────┐
//!                                             │
//!     ┌───────────────────────────────────────┘
//!     ▼ recv()
//! DispatchWorker (one per run)
//!     │
//!     ├─► Stage 1 ─┬─► Handler A ─┐
//!     │            └─► Handler B ─┤  Parallel:   spawned, bounded wait
//!     │                           │  Sequential: awaited in order
//!     │   ◄───────────────────────┘
//!     ├─► Stage 2 ───► Handler C
//!     │
//!     └─► Stage N ...
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One worker** - at most one worker consumes the queue at any time
//! 2. **FIFO** - events start processing in the order they were dispatched
//! 3. **Stage barrier** - stage `k + 1` never starts before stage `k` finished
//!    (or timed out)
//! 4. **Frozen stages** - the stage table cannot change while running
//! 5. **Fire-and-forget** - handler failures are logged and counted, never
//!    returned to the producer
//!
//! ## Guarantees
//!
//! - **At-most-once delivery**: events queued at shutdown are discarded
//! - **In-memory only**: nothing is persisted
//! - **No backpressure**: the queue grows without bound
//!
//! ## Example
//!
//! ```ignore
//! use staged_dispatch::{async_trait, Dispatcher, DispatcherConfig, Handler};
//!
//! #[derive(Debug)]
//! struct OrderPlaced {
//!     order_id: u64,
//! }
//!
//! struct ReserveStock;
//!
//! #[async_trait]
//! impl Handler<OrderPlaced> for ReserveStock {
//!     async fn handle(&self, event: &OrderPlaced) -> anyhow::Result<()> {
//!         inventory::reserve(event.order_id).await
//!     }
//! }
//!
//! let dispatcher = Dispatcher::new(
//!     DispatcherConfig::parallel(2_000).with_break_on_exception(true),
//! )?;
//!
//! dispatcher
//!     .extend_one(ValidateOrder)
//!     .extend_one(ReserveStock)
//!     .then_one(SendConfirmation);
//!
//! dispatcher.start()?;
//! dispatcher.dispatch(OrderPlaced { order_id: 42 });
//!
//! dispatcher.shutdown().await?;
//! ```
//!
//! ## What This Is Not
//!
//! - A durable queue or message broker
//! - A request/response bus (nothing comes back from `dispatch`)
//! - A way to cancel handlers that overrun the stage timeout

// Core modules
mod atomic;
mod config;
mod core;
mod dispatcher;
mod error;
mod queue;
mod stage;
mod stats;
mod worker;

// Testing utilities (feature-gated, always built for this crate's own tests)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Re-export atomic primitives
pub use atomic::{AtomicCounter, AtomicFlag};

// Re-export configuration
pub use config::{DispatchMode, DispatcherConfig, DEFAULT_STAGE_TIMEOUT_MS};

// Re-export core traits
pub use crate::core::{Event, Handler, HandlerFn, HandlerRef};

// Re-export the facade
pub use dispatcher::Dispatcher;

// Re-export error types
pub use error::{ConfigError, DispatchError, FlagError, StageFailure};

// Re-export stage and stats views
pub use stage::{Stage, StageTable};
pub use stats::DispatcherStats;

// Re-export async_trait for handler implementations
pub use async_trait::async_trait;
