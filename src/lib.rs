//! # A3S Relay
//!
//! An in-process priority message queue with persistence hooks, retry
//! backoff and dead-lettering.
//!
//! ## Core
//!
//! - Named queues with bounded capacity; higher priority first, FIFO within a priority
//! - One dispatcher per queue feeding a shared worker pool
//! - Retry with exponential backoff, then a bounded per-queue dead-letter store
//! - Dead-letter replay and TTL expiry (periodic sweep)
//! - Pluggable persistence (`MessagePersistence` trait, `MemoryPersistence`
//!   and `LocalPersistence` included); acknowledged messages are deleted
//! - Atomic per-queue counters and a lifecycle event stream
//! - Graceful shutdown with a grace period for in-flight handlers
//!
//! ## Feature Flags
//!
//! | Feature | Default | Dependencies | Description |
//! |---------|---------|-------------|-------------|
//! | `telemetry` | ❌ | `opentelemetry` | Mirror queue counters to OpenTelemetry instruments |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use a3s_relay::{MessageQueue, Result, RetryPolicy};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let queue = MessageQueue::<String>::builder()
//!         .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(100), 2.0))
//!         .with_queue("emails", 1_000)
//!         .build()
//!         .await?;
//!
//!     queue
//!         .register_handler("emails", |address: &String| -> anyhow::Result<()> {
//!             println!("sending to {}", address);
//!             Ok(())
//!         })
//!         .await?;
//!     queue.start().await?;
//!
//!     queue.send_with_priority("emails", "ops@example.com".into(), 10).await?;
//!
//!     queue.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
mod dispatcher;
pub mod dlq;
pub mod error;
pub mod event;
pub mod manager;
pub mod message;
pub mod metrics;
pub mod persistence;
pub mod queue;
pub mod retry;
pub mod scheduler;

#[cfg(feature = "telemetry")]
pub mod telemetry;

pub use config::{MessageQueueConfig, DEFAULT_QUEUE};
pub use dlq::{DeadLetter, DeadLetterStore};
pub use error::{RelayError, Result};
pub use event::{events, EventEmitter, EventPayload, EventStream, QueueEvent};
pub use manager::{MessageQueue, MessageQueueBuilder};
pub use message::{Message, MessageId, Payload, Priority, QueueName};
pub use metrics::{metric_names, Counter, MetricsSnapshot, QueueCounterSnapshot, QueueMetrics};
pub use persistence::{LocalPersistence, MemoryPersistence, MessagePersistence, NoopPersistence};
pub use queue::{AsyncHandler, MessageHandler, NamedQueue};
pub use retry::RetryPolicy;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Queue statistics snapshot
///
/// A point-in-time view across all queues.
///
/// ```rust,ignore
/// let stats = queue.stats().await;
/// println!("{} ready, {} dead-lettered", stats.total_ready, stats.dead_letter_count);
///
/// for (name, status) in &stats.queues {
///     println!("{}: {}/{} ready", name, status.ready, status.capacity);
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_ready: usize,
    pub dead_letter_count: usize,
    pub queues: HashMap<String, QueueStatus>,
}

/// State of a single queue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Messages waiting for dispatch
    pub ready: usize,
    pub capacity: usize,
    pub dead_letters: usize,
    pub has_handler: bool,
}
