//! Core traits: events and the handlers that observe them.
//!
//! # Overview
//!
//! - [`Event`] = an opaque payload. The dispatcher transports it, never
//!   inspects or mutates it.
//! - [`Handler`] = a unit of work run against each event, grouped into
//!   stages by the dispatcher.
//!
//! Handlers carry no identity the dispatcher relies on beyond their position
//! in the stage table. [`Handler::name`] exists for log fields and error
//! messages only.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

/// Marker trait for event payloads.
///
/// Automatically implemented for every `Send + Sync + 'static` type. Events
/// are shared between parallel handlers behind an `Arc`, so they need not be
/// `Clone`.
pub trait Event: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Event for T {}

/// A capability that processes one event.
///
/// Returning `Err` (or panicking) marks the handler's stage as failed. What
/// happens next depends on `break_on_exception`; the error itself never
/// reaches the code that dispatched the event.
///
/// # Example
///
/// ```ignore
/// use staged_dispatch::{async_trait, Handler};
///
/// struct IndexOrder {
///     search: SearchClient,
/// }
///
/// #[async_trait]
/// impl Handler<OrderPlaced> for IndexOrder {
///     async fn handle(&self, event: &OrderPlaced) -> anyhow::Result<()> {
///         self.search.index(event.order_id).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<E: Event>: Send + Sync + 'static {
    /// Process a single event.
    async fn handle(&self, event: &E) -> Result<()>;

    /// Name used in logs and failure messages.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Shared, type-erased handler as stored in the stage table.
pub type HandlerRef<E> = Arc<dyn Handler<E>>;

/// Handler backed by a synchronous closure.
///
/// Useful for small side effects (recording, metrics, logging) that do not
/// need to await anything.
///
/// ```ignore
/// let audit = HandlerFn::arc("audit", |event: &OrderPlaced| {
///     tracing::info!(order_id = %event.order_id, "order placed");
///     Ok(())
/// });
/// ```
pub struct HandlerFn<F> {
    name: &'static str,
    f: F,
}

impl<F> HandlerFn<F> {
    /// Wrap a closure under the given name.
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }

    /// Wrap a closure and return it as a [`HandlerRef`].
    pub fn arc<E>(name: &'static str, f: F) -> HandlerRef<E>
    where
        E: Event,
        F: Fn(&E) -> Result<()> + Send + Sync + 'static,
    {
        Arc::new(Self::new(name, f))
    }
}

#[async_trait]
impl<E, F> Handler<E> for HandlerFn<F>
where
    E: Event,
    F: Fn(&E) -> Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, event: &E) -> Result<()> {
        (self.f)(event)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerFn")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Ping(u32);

    struct Echo;

    #[async_trait]
    impl Handler<Ping> for Echo {
        async fn handle(&self, event: &Ping) -> Result<()> {
            if event.0 == 0 {
                anyhow::bail!("zero ping");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handler_default_name_is_type_name() {
        assert!(Echo.name().ends_with("Echo"));
        assert!(Echo.handle(&Ping(1)).await.is_ok());
        assert!(Echo.handle(&Ping(0)).await.is_err());
    }

    #[tokio::test]
    async fn test_handler_ref_is_type_erased() {
        let handlers: Vec<HandlerRef<Ping>> = vec![
            Arc::new(Echo),
            HandlerFn::arc("noop", |_: &Ping| Ok(())),
        ];
        assert!(handlers[0].name().ends_with("Echo"));
        assert_eq!(handlers[1].name(), "noop");
        for handler in &handlers {
            assert!(handler.handle(&Ping(5)).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_handler_fn_runs_closure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handler = HandlerFn::arc("counter", move |event: &Ping| {
            seen.fetch_add(event.0 as usize, Ordering::SeqCst);
            Ok(())
        });

        handler.handle(&Ping(3)).await.unwrap();
        handler.handle(&Ping(4)).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 7);
        assert_eq!(handler.name(), "counter");
    }

    #[test]
    fn test_handler_fn_debug() {
        let handler = HandlerFn::new("debuggable", |_: &Ping| -> Result<()> { Ok(()) });
        assert!(format!("{:?}", handler).contains("debuggable"));
    }
}
