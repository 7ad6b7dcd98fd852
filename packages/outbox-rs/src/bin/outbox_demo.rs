// Demo: runs a dispatcher against the in-memory store until Ctrl-C

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use outbox::{
    DispatcherConfig, Envelope, HandlerRegistry, InMemoryOutboxStore, OutboxDispatcher,
    OutboxStore, OutboxWriter,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: String,
    total_cents: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,outbox=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DispatcherConfig::from_env().context("Failed to load outbox configuration")?;
    tracing::info!(?config, "Configuration loaded");

    let store: Arc<dyn OutboxStore> = Arc::new(InMemoryOutboxStore::new());
    let writer = OutboxWriter::new(store.clone());

    let mut registry = HandlerRegistry::new();
    registry.register_fn("order.placed", |envelope| async move {
        let order: OrderPlaced = envelope.decode()?;
        tracing::info!(
            order_id = %order.order_id,
            total_cents = order.total_cents,
            "sending order confirmation"
        );
        Ok(())
    });

    // Fails its first two calls to show retries with backoff
    let charge_calls = Arc::new(AtomicUsize::new(0));
    registry.register_fn("payment.requested", move |envelope| {
        let charge_calls = charge_calls.clone();
        async move {
            let call = charge_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= 2 {
                bail!("payment provider unavailable (call {})", call);
            }
            tracing::info!(payment = %envelope.aggregate_id(), "payment captured");
            Ok(())
        }
    });

    let dispatcher = OutboxDispatcher::new(store, registry, config)?;
    dispatcher.start();

    let order = OrderPlaced {
        order_id: "ord-1001".to_string(),
        total_cents: 4_250,
    };
    let placed = Envelope::encode("order.placed", "order", &order.order_id, &order)?
        .dedup_key(format!("order.placed:{}", order.order_id))
        .build();
    let duplicate = Envelope::encode("order.placed", "order", &order.order_id, &order)?
        .dedup_key(format!("order.placed:{}", order.order_id))
        .build();
    let payment = Envelope::builder(
        "payment.requested",
        "payment",
        "pay-77",
        serde_json::json!({ "order_id": order.order_id }),
    )
    .priority(10)
    .build();
    let audit = Envelope::builder("order.audited", "order", &order.order_id, serde_json::json!({}))
        .deliver_in(Duration::from_secs(2))
        .build();

    let results = writer
        .enqueue_many(vec![placed, duplicate, payment, audit])
        .await?;
    tracing::info!(?results, "Demo envelopes enqueued");

    tracing::info!("Outbox dispatcher running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    dispatcher.shutdown().await;

    let snapshot = dispatcher.snapshot().await?;
    tracing::info!(
        snapshot = %serde_json::to_string(&snapshot)?,
        "Outbox dispatcher shut down"
    );

    Ok(())
}
