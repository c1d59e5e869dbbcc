//! A three-stage order pipeline.
//!
//! ```text
//! DISPATCH_MODE=parallel DISPATCH_STAGE_TIMEOUT_MS=200 \
//!     RUST_LOG=debug cargo run -p staged-dispatch --example pipeline
//! ```

use std::time::Duration;

use anyhow::Result;
use staged_dispatch::{async_trait, Dispatcher, DispatcherConfig, Handler, HandlerFn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug)]
struct OrderPlaced {
    order_id: u64,
    quantity: u32,
}

struct ValidateOrder;

#[async_trait]
impl Handler<OrderPlaced> for ValidateOrder {
    async fn handle(&self, event: &OrderPlaced) -> Result<()> {
        anyhow::ensure!(event.quantity > 0, "order {} has no items", event.order_id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "validate_order"
    }
}

struct ReserveStock;

#[async_trait]
impl Handler<OrderPlaced> for ReserveStock {
    async fn handle(&self, event: &OrderPlaced) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(20 * u64::from(event.quantity))).await;
        tracing::info!(order_id = event.order_id, quantity = event.quantity, "stock reserved");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "reserve_stock"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,staged_dispatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let config = DispatcherConfig::from_env()?;
    tracing::info!(name = %config.name, mode = %config.mode, "loaded dispatcher config");

    let dispatcher = Dispatcher::new(config)?;
    dispatcher
        .extend_one(ValidateOrder)
        .extend_one(ReserveStock)
        .then([HandlerFn::arc("send_confirmation", |event: &OrderPlaced| {
            tracing::info!(order_id = event.order_id, "confirmation sent");
            Ok(())
        })]);

    dispatcher.start()?;

    for (order_id, quantity) in [(1, 2), (2, 0), (3, 15), (4, 1)] {
        dispatcher.dispatch(OrderPlaced { order_id, quantity });
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    dispatcher.shutdown().await?;

    let stats = dispatcher.stats();
    tracing::info!(
        processed = stats.events_processed,
        failures = stats.handler_failures,
        timeouts = stats.stage_timeouts,
        discarded = stats.events_discarded,
        "pipeline finished"
    );
    Ok(())
}
