//! Message queue facade and builder

use crate::config::{MessageQueueConfig, DEFAULT_QUEUE};
use crate::dispatcher::Dispatcher;
use crate::dlq::DeadLetter;
use crate::error::Result;
use crate::event::{EventEmitter, EventStream, QueueEvent};
use crate::message::{MessageId, Payload, Priority, QueueName};
use crate::metrics::MetricsSnapshot;
use crate::persistence::{MessagePersistence, NoopPersistence};
use crate::queue::MessageHandler;
use crate::retry::RetryPolicy;
use crate::QueueStats;
use std::sync::Arc;

/// In-process priority message queue
///
/// Cheap to clone; clones drive the same queues. Dispatch begins with
/// [`start`](Self::start); messages sent earlier wait in their queues.
pub struct MessageQueue<T: Payload> {
    engine: Arc<Dispatcher<T>>,
}

impl<T: Payload> Clone for MessageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<T: Payload> MessageQueue<T> {
    /// Start building a message queue
    pub fn builder() -> MessageQueueBuilder<T> {
        MessageQueueBuilder::new()
    }

    /// Spawn the per-queue dispatchers and the periodic dead-letter sweep
    ///
    /// Calling it again is a no-op.
    pub async fn start(&self) -> Result<()> {
        self.engine.start().await
    }

    /// Create a named queue; an existing queue is left untouched
    ///
    /// Its dead-letter store gets the same capacity.
    pub async fn create_queue(&self, name: &str, capacity: usize) -> Result<()> {
        self.engine.create_queue(name, capacity).await
    }

    /// Install the handler for a queue, replacing the previous one
    pub async fn register_handler<H>(&self, name: &str, handler: H) -> Result<()>
    where
        H: MessageHandler<T> + 'static,
    {
        self.engine.register_handler(name, Arc::new(handler)).await
    }

    /// Send with priority 0
    pub async fn send(&self, name: &str, payload: T) -> Result<MessageId> {
        self.engine.send(name, payload, 0).await
    }

    /// Persist and enqueue a payload; higher priorities are delivered first
    ///
    /// # Errors
    ///
    /// - [`RelayError::QueueNotFound`](crate::RelayError::QueueNotFound) before anything is persisted
    /// - [`RelayError::Persistence`](crate::RelayError::Persistence) if the persist hook fails
    /// - [`RelayError::QueueFull`](crate::RelayError::QueueFull) if the queue stayed full for `send_timeout`
    /// - [`RelayError::ShutdownInProgress`](crate::RelayError::ShutdownInProgress)
    pub async fn send_with_priority(
        &self,
        name: &str,
        payload: T,
        priority: Priority,
    ) -> Result<MessageId> {
        self.engine.send(name, payload, priority).await
    }

    /// Dead letters of a queue, oldest first
    pub async fn get_dead_letters(&self, name: &str) -> Result<Vec<DeadLetter<T>>> {
        self.engine.dead_letters(name).await
    }

    /// Replay a dead letter with its retry count reset
    ///
    /// Returns `Ok(false)` when the queue has no dead letter with that ID.
    pub async fn retry_dead_letter(&self, name: &str, message_id: &str) -> Result<bool> {
        self.engine.retry_dead_letter(name, message_id).await
    }

    /// Run the dead-letter expiry sweep now, returning how many letters expired
    pub async fn sweep_dead_letters(&self) -> Result<usize> {
        self.engine.sweep_dead_letters().await
    }

    /// Re-enqueue every message the persistence layer still holds
    ///
    /// Meant to run once at startup, after the queues are created and before
    /// new traffic arrives.
    pub async fn recover(&self) -> Result<usize> {
        self.engine.recover().await
    }

    /// Current counter values
    pub fn metrics(&self) -> MetricsSnapshot {
        self.engine.metrics().snapshot()
    }

    /// Get queue statistics
    pub async fn stats(&self) -> QueueStats {
        self.engine.stats().await
    }

    /// Names of every queue, sorted
    pub async fn queue_names(&self) -> Vec<QueueName> {
        self.engine.queue_names().await
    }

    /// Stop accepting sends, let in-flight handlers finish within the grace
    /// period and abort the rest
    ///
    /// Pending retry timers are cancelled; their messages stay in persistence.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }

    /// Check if shutdown is in progress
    pub fn is_shutting_down(&self) -> bool {
        self.engine.is_shutting_down()
    }

    /// Number of live tasks (dispatchers, handlers, timers, sweeps)
    pub fn active_tasks(&self) -> usize {
        self.engine.active_tasks()
    }

    pub fn config(&self) -> &MessageQueueConfig {
        self.engine.config()
    }

    /// Subscribe to all queue lifecycle events as an `EventStream` (implements `Stream`)
    pub fn subscribe_stream(&self) -> EventStream {
        self.engine.events().subscribe_stream()
    }

    /// Subscribe to filtered queue lifecycle events as an `EventStream`
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&QueueEvent) -> bool + Send + Sync + 'static,
    ) -> EventStream {
        self.engine.events().subscribe_filtered(filter)
    }
}

/// Message queue builder
pub struct MessageQueueBuilder<T: Payload> {
    config: MessageQueueConfig,
    persistence: Option<Arc<dyn MessagePersistence<T>>>,
    event_emitter: Option<EventEmitter>,
    queues: Vec<(QueueName, usize)>,
}

impl<T: Payload> Default for MessageQueueBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Payload> MessageQueueBuilder<T> {
    pub fn new() -> Self {
        Self {
            config: MessageQueueConfig::default(),
            persistence: None,
            event_emitter: None,
            queues: Vec::new(),
        }
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: MessageQueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.config.retry_policy = retry_policy;
        self
    }

    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.config.worker_threads = worker_threads;
        self
    }

    /// Add persistence backend (defaults to [`NoopPersistence`])
    pub fn with_persistence(mut self, persistence: Arc<dyn MessagePersistence<T>>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Share an existing event emitter
    pub fn with_event_emitter(mut self, event_emitter: EventEmitter) -> Self {
        self.event_emitter = Some(event_emitter);
        self
    }

    /// Create an extra queue at build time
    pub fn with_queue(mut self, name: impl Into<QueueName>, capacity: usize) -> Self {
        self.queues.push((name.into(), capacity));
        self
    }

    /// Build the message queue, creating the `"default"` queue and any extra queues
    pub async fn build(self) -> Result<MessageQueue<T>> {
        self.config.validate()?;

        let persistence = self
            .persistence
            .unwrap_or_else(|| Arc::new(NoopPersistence));
        let events = self.event_emitter.unwrap_or_default();
        let default_capacity = self.config.default_queue_capacity;

        let engine = Arc::new(Dispatcher::new(self.config, persistence, events));
        engine.create_queue(DEFAULT_QUEUE, default_capacity).await?;
        for (name, capacity) in &self.queues {
            engine.create_queue(name, *capacity).await?;
        }

        Ok(MessageQueue { engine })
    }
}
