//! Reliability features example
//!
//! This example demonstrates:
//! - Retry policies with exponential backoff
//! - Dead-letter store and replay
//! - File-backed persistence and recovery after a restart
//! - Graceful shutdown
//!
//! Run with: `RUST_LOG=a3s_relay=debug cargo run --example reliability`

use a3s_relay::{
    events, LocalPersistence, MessageHandler, MessagePersistence, MessageQueue, MessageQueueConfig,
    RetryPolicy,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Payment {
    order_id: String,
    amount_cents: u64,
}

/// Charges payments against a gateway that can be switched off
struct PaymentHandler {
    gateway_up: Arc<AtomicBool>,
    attempts: AtomicU32,
}

#[async_trait]
impl MessageHandler<Payment> for PaymentHandler {
    async fn handle(&self, payment: &Payment) -> anyhow::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        println!(
            "  [{}] attempt {} for {} cents",
            payment.order_id, attempt, payment.amount_cents
        );

        if !self.gateway_up.load(Ordering::SeqCst) {
            anyhow::bail!("payment gateway unavailable");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(())
    }
}

fn config() -> MessageQueueConfig {
    MessageQueueConfig::default()
        .with_worker_threads(4)
        .with_poll_interval(Duration::from_millis(20))
        .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(50), 2.0))
        .with_dead_letter_ttl(Duration::from_secs(60))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("a3s_relay=info")),
        )
        .init();

    println!("=== A3S Relay: Reliability Example ===\n");

    let storage = tempfile::tempdir()?;
    let persistence = Arc::new(LocalPersistence::<Payment>::new(storage.path()).await?);
    let gateway_up = Arc::new(AtomicBool::new(false));

    // ------------------------------------------------------------------
    // 1. Retries until the dead-letter store
    // ------------------------------------------------------------------
    println!("1. Sending a payment while the gateway is down...");

    let queue = MessageQueue::builder()
        .with_config(config())
        .with_persistence(persistence.clone())
        .with_queue("payments", 100)
        .build()
        .await?;
    queue
        .register_handler(
            "payments",
            PaymentHandler {
                gateway_up: Arc::clone(&gateway_up),
                attempts: AtomicU32::new(0),
            },
        )
        .await?;

    let mut dead_letters = queue.subscribe_filtered(|e| e.key == events::MESSAGE_DEAD_LETTERED);
    queue.start().await?;

    let id = queue
        .send(
            "payments",
            Payment {
                order_id: "order-1".to_string(),
                amount_cents: 4_200,
            },
        )
        .await?;

    if let Some(event) = dead_letters.recv().await {
        println!("✓ Dead-lettered: {:?}\n", event.payload.get("error"));
    }

    // ------------------------------------------------------------------
    // 2. Replay once the gateway is back
    // ------------------------------------------------------------------
    println!("2. Gateway recovered, replaying the dead letter...");
    gateway_up.store(true, Ordering::SeqCst);
    queue.retry_dead_letter("payments", &id).await?;
    wait_until(|| queue.metrics().queue("payments").processed == 1).await;
    println!("✓ Replayed and processed\n");

    // ------------------------------------------------------------------
    // 3. Recovery across a restart
    // ------------------------------------------------------------------
    println!("3. Queueing payments without a running dispatcher...");
    let stopped = MessageQueue::builder()
        .with_config(config())
        .with_persistence(persistence.clone())
        .with_queue("payments", 100)
        .build()
        .await?;
    for n in 2..=4 {
        stopped
            .send(
                "payments",
                Payment {
                    order_id: format!("order-{}", n),
                    amount_cents: 1_000 * n,
                },
            )
            .await?;
    }
    stopped.shutdown().await;
    println!(
        "  {} payments left on disk",
        persistence.load("payments").await?.len()
    );

    let restarted = MessageQueue::builder()
        .with_config(config())
        .with_persistence(persistence.clone())
        .with_queue("payments", 100)
        .build()
        .await?;
    restarted
        .register_handler(
            "payments",
            PaymentHandler {
                gateway_up: Arc::clone(&gateway_up),
                attempts: AtomicU32::new(0),
            },
        )
        .await?;
    let recovered = restarted.recover().await?;
    restarted.start().await?;
    wait_until(|| restarted.metrics().queue("payments").processed == recovered as u64).await;
    println!("✓ Recovered and processed {} payments\n", recovered);

    // ------------------------------------------------------------------
    // Summary
    // ------------------------------------------------------------------
    let counters = queue.metrics().queue("payments");
    println!("=== Metrics (first run) ===");
    println!("  sent:          {}", counters.sent);
    println!("  failed:        {}", counters.failed);
    println!("  retried:       {}", counters.retried);
    println!("  dead-lettered: {}", counters.dead_lettered);
    println!("  replayed:      {}", counters.dead_letter_retried);
    println!("  processed:     {}", counters.processed);

    queue.shutdown().await;
    restarted.shutdown().await;
    println!("\n✓ Shutdown complete");
    Ok(())
}
