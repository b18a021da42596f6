//! Delivery engine: send path, per-queue dispatch loops, retries and dead-lettering
//!
//! [`Dispatcher`] owns every shared piece of state. The public facade
//! ([`MessageQueue`](crate::MessageQueue)) is a thin handle around an
//! `Arc<Dispatcher<T>>`.

use crate::config::MessageQueueConfig;
use crate::dlq::DeadLetter;
use crate::error::{RelayError, Result};
use crate::event::{events, EventEmitter, QueueEvent};
use crate::message::{Message, MessageId, Payload, Priority};
use crate::metrics::{Counter, QueueMetrics};
use crate::persistence::MessagePersistence;
use crate::queue::{MessageHandler, NamedQueue, QueueRegistry};
use crate::scheduler::{panic_message, Scheduler};
use crate::{QueueStats, QueueStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub(crate) struct Dispatcher<T: Payload> {
    registry: QueueRegistry<T>,
    persistence: Arc<dyn MessagePersistence<T>>,
    metrics: QueueMetrics,
    events: EventEmitter,
    config: MessageQueueConfig,
    scheduler: Scheduler,
    workers: Arc<Semaphore>,
    started: AtomicBool,
    shutting_down: AtomicBool,
}

/// Re-tag a collaborator error as a persistence error
fn as_persistence_error(err: RelayError) -> RelayError {
    match err {
        RelayError::Persistence(_) => err,
        other => RelayError::Persistence(other.to_string()),
    }
}

/// Wait for a handler task, converting every way it can end into a `Result`
async fn join_handler(
    task: &mut JoinHandle<anyhow::Result<()>>,
    timeout: Option<Duration>,
) -> Result<()> {
    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut *task).await {
            Ok(joined) => joined,
            Err(_) => {
                task.abort();
                return Err(RelayError::Timeout(limit));
            }
        },
        None => (&mut *task).await,
    };

    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(RelayError::handler(&err)),
        Err(join_err) => Err(RelayError::HandlerFailed(format!(
            "handler panicked: {}",
            panic_message(join_err)
        ))),
    }
}

impl<T: Payload> Dispatcher<T> {
    pub(crate) fn new(
        config: MessageQueueConfig,
        persistence: Arc<dyn MessagePersistence<T>>,
        events: EventEmitter,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_threads.max(1)));
        Self {
            registry: QueueRegistry::new(),
            persistence,
            metrics: QueueMetrics::new(),
            events,
            config,
            scheduler: Scheduler::new(),
            workers,
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn config(&self) -> &MessageQueueConfig {
        &self.config
    }

    pub(crate) fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    pub(crate) fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutting_down() {
            Err(RelayError::ShutdownInProgress)
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Queue lifecycle
    // ========================================================================

    /// Create a queue if it does not exist yet
    pub(crate) async fn create_queue(self: &Arc<Self>, name: &str, capacity: usize) -> Result<()> {
        self.ensure_running()?;
        if capacity == 0 {
            return Err(RelayError::ConfigError(format!(
                "queue '{}' needs a capacity of at least 1",
                name
            )));
        }

        let (queue, created) = self.registry.create(name, capacity).await;
        if !created {
            tracing::debug!(queue = %name, "a3s.relay.queue: already exists");
            return Ok(());
        }

        self.metrics.register_queue(name);
        tracing::info!(queue = %name, capacity, "a3s.relay.queue: created");
        self.events
            .emit(QueueEvent::for_queue(events::QUEUE_CREATED, name));

        if self.is_started() {
            self.spawn_dispatcher(queue);
        }
        Ok(())
    }

    pub(crate) async fn register_handler(
        &self,
        name: &str,
        handler: Arc<dyn MessageHandler<T>>,
    ) -> Result<()> {
        let queue = self.registry.get(name).await?;
        queue.set_handler(handler).await;

        tracing::info!(queue = %name, "a3s.relay.queue: handler registered");
        self.events
            .emit(QueueEvent::for_queue(events::QUEUE_HANDLER_REGISTERED, name));
        Ok(())
    }

    /// Spawn a dispatcher per queue and the periodic dead-letter sweep
    pub(crate) async fn start(self: &Arc<Self>) -> Result<()> {
        self.ensure_running()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!(
            workers = self.config.worker_threads,
            "a3s.relay: starting dispatchers"
        );

        for queue in self.registry.all().await {
            self.spawn_dispatcher(queue);
        }

        let engine = Arc::clone(self);
        let metrics = self.metrics.clone();
        self.scheduler.schedule_at_fixed_rate(
            "dead_letter_sweep",
            self.config.sweep_interval,
            move || {
                let engine = Arc::clone(&engine);
                async move { engine.sweep_dead_letters().await.map(|_| ()) }
            },
            move |_| metrics.record_sweep_error(),
        );
        Ok(())
    }

    /// Stop dispatching, drain in-flight handlers within the grace period, abort the rest
    pub(crate) async fn shutdown(&self) {
        let first = !self.shutting_down.swap(true, Ordering::SeqCst);
        if first {
            tracing::info!("a3s.relay: shutdown started");
            self.events
                .emit(QueueEvent::empty(events::QUEUE_SHUTDOWN_STARTED));
        }

        let drained = self.scheduler.shutdown(self.config.shutdown_grace).await;

        if first {
            if drained {
                tracing::info!("a3s.relay: shutdown complete");
            } else {
                tracing::warn!(
                    grace_ms = self.config.shutdown_grace.as_millis() as u64,
                    "a3s.relay: shutdown complete, in-flight handlers were aborted"
                );
            }
            self.events
                .emit(QueueEvent::empty(events::QUEUE_SHUTDOWN_COMPLETE));
        }
    }

    // ========================================================================
    // Send path
    // ========================================================================

    pub(crate) async fn send(
        &self,
        name: &str,
        payload: T,
        priority: Priority,
    ) -> Result<MessageId> {
        self.ensure_running()?;
        let queue = self.registry.get(name).await?;
        let message = Message::new(payload, priority);
        let message_id = message.id.clone();

        if let Err(err) = self.persistence.persist(name, &message).await {
            let err = as_persistence_error(err);
            self.metrics.increment(name, Counter::PersistenceErrors);
            tracing::warn!(
                queue = %name,
                message_id = %message_id,
                error = %err,
                "a3s.relay.send: persist failed, message rejected"
            );
            return Err(err);
        }

        let timeout = self.config.send_timeout;
        if let Err(message) = queue.offer(message, timeout).await {
            tracing::warn!(
                queue = %name,
                message_id = %message_id,
                timeout_ms = timeout.as_millis() as u64,
                "a3s.relay.send: queue full, message rejected"
            );
            self.forget(name, &message.id).await;
            return Err(RelayError::QueueFull {
                queue: name.to_string(),
                timeout,
            });
        }

        self.metrics.increment(name, Counter::Sent);
        tracing::debug!(
            queue = %name,
            message_id = %message_id,
            priority,
            "a3s.relay.send: message enqueued"
        );
        self.events.emit(QueueEvent::for_message(
            events::MESSAGE_SENT,
            name,
            &message_id,
            &[("priority", serde_json::json!(priority))],
        ));
        Ok(message_id)
    }

    /// Delete a message from persistence; failures are logged and counted only
    async fn forget(&self, name: &str, message_id: &str) {
        if let Err(err) = self.persistence.delete(name, message_id).await {
            self.metrics.increment(name, Counter::PersistenceErrors);
            tracing::warn!(
                queue = %name,
                message_id = %message_id,
                error = %err,
                "a3s.relay.persistence: delete failed"
            );
        }
    }

    // ========================================================================
    // Dispatch loop
    // ========================================================================

    fn spawn_dispatcher(self: &Arc<Self>, queue: Arc<NamedQueue<T>>) {
        if !queue.claim_dispatcher() {
            return;
        }

        let engine = Arc::clone(self);
        let shutdown = self.scheduler.shutdown_token();
        let poll_interval = self.config.poll_interval;

        self.scheduler.spawn(async move {
            tracing::debug!(queue = %queue.name(), "a3s.relay.dispatcher: started");
            loop {
                let polled = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    polled = queue.poll(poll_interval) => polled,
                };
                if let Some(message) = polled {
                    engine.process(&queue, message).await;
                }
            }
            queue.release_dispatcher();
            tracing::debug!(queue = %queue.name(), "a3s.relay.dispatcher: stopped");
        });
    }

    /// Deliver one message and act on the outcome
    async fn process(self: &Arc<Self>, queue: &Arc<NamedQueue<T>>, message: Message<T>) {
        let name = queue.name();

        let Some(handler) = queue.handler().await else {
            let error = RelayError::NoHandler(name.to_string());
            self.dead_letter(queue, message, &error).await;
            return;
        };

        let force = self.scheduler.force_token();
        let permit = tokio::select! {
            biased;
            _ = force.cancelled() => None,
            permit = Arc::clone(&self.workers).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            tracing::warn!(
                queue = %name,
                message_id = %message.id,
                "a3s.relay.dispatcher: no worker available, message left in persistence"
            );
            return;
        };

        tracing::debug!(
            queue = %name,
            message_id = %message.id,
            retry_count = message.retry_count,
            "a3s.relay.dispatcher: invoking handler"
        );

        let payload = message.payload.clone();
        let mut task = self.scheduler.spawn(async move {
            let _permit = permit;
            handler.handle(&payload).await
        });

        let outcome = tokio::select! {
            biased;
            _ = force.cancelled() => None,
            outcome = join_handler(&mut task, self.config.handler_timeout) => Some(outcome),
        };
        let Some(outcome) = outcome else {
            task.abort();
            tracing::warn!(
                queue = %name,
                message_id = %message.id,
                "a3s.relay.dispatcher: handler aborted at shutdown, message left in persistence"
            );
            return;
        };

        match outcome {
            Ok(()) => {
                self.forget(name, &message.id).await;
                self.metrics.increment(name, Counter::Processed);
                tracing::debug!(
                    queue = %name,
                    message_id = %message.id,
                    "a3s.relay.dispatcher: message processed"
                );
                self.events.emit(QueueEvent::for_message(
                    events::MESSAGE_PROCESSED,
                    name,
                    &message.id,
                    &[],
                ));
            }
            Err(error) => {
                self.metrics.increment(name, Counter::Failed);
                tracing::debug!(
                    queue = %name,
                    message_id = %message.id,
                    error = %error,
                    "a3s.relay.dispatcher: handler failed"
                );
                self.events.emit(QueueEvent::for_message(
                    events::MESSAGE_FAILED,
                    name,
                    &message.id,
                    &[("error", serde_json::json!(error.to_string()))],
                ));
                self.handle_failure(queue, message, error).await;
            }
        }
    }

    /// Reschedule a failed message, or dead-letter it once retries are exhausted
    async fn handle_failure(
        self: &Arc<Self>,
        queue: &Arc<NamedQueue<T>>,
        mut message: Message<T>,
        error: RelayError,
    ) {
        let policy = &self.config.retry_policy;
        if !policy.should_retry(message.retry_count) {
            self.dead_letter(queue, message, &error).await;
            return;
        }

        let attempt = message.increment_retry();
        let delay = policy.delay_for_attempt(attempt);
        let name = queue.name().to_string();
        let message_id = message.id.clone();

        tracing::info!(
            queue = %name,
            message_id = %message_id,
            retry_attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            "a3s.relay.retry: scheduling retry"
        );
        self.events.emit(QueueEvent::for_message(
            events::MESSAGE_RETRY_SCHEDULED,
            &name,
            &message_id,
            &[
                ("retry_count", serde_json::json!(attempt)),
                ("delay_ms", serde_json::json!(delay.as_millis() as u64)),
            ],
        ));

        let engine = Arc::clone(self);
        let target = Arc::clone(queue);
        let scheduled = self.scheduler.schedule_after(delay, async move {
            target.push(message).await;
            engine.metrics.increment(target.name(), Counter::Retried);
            engine.events.emit(QueueEvent::for_message(
                events::MESSAGE_RETRIED,
                target.name(),
                &message_id,
                &[("retry_count", serde_json::json!(attempt))],
            ));
        });

        if !scheduled {
            tracing::debug!(
                queue = %name,
                "a3s.relay.retry: shutting down, retry dropped and message left in persistence"
            );
        }
    }

    /// Park a message in its queue's dead-letter store
    ///
    /// Counters and events are published after the store (and any eviction)
    /// has been updated.
    async fn dead_letter(&self, queue: &NamedQueue<T>, message: Message<T>, error: &RelayError) {
        let name = queue.name();
        let message_id = message.id.clone();
        let retry_count = message.retry_count;
        let error = error.to_string();

        let letter = DeadLetter::new(message, error.clone());
        if let Some(evicted) = queue.dead_letters().push(letter).await {
            tracing::warn!(
                queue = %name,
                message_id = %evicted.message.id,
                dead_lettered_at = %evicted.dead_lettered_at,
                "a3s.relay.dlq: store full, evicted oldest dead letter"
            );
            self.forget(name, &evicted.message.id).await;
            self.events.emit(QueueEvent::for_message(
                events::DEAD_LETTER_EVICTED,
                name,
                &evicted.message.id,
                &[],
            ));
        }

        tracing::warn!(
            queue = %name,
            message_id = %message_id,
            retry_count,
            error = %error,
            "a3s.relay.dlq: message dead-lettered"
        );
        self.metrics.increment(name, Counter::DeadLettered);
        self.events.emit(QueueEvent::for_message(
            events::MESSAGE_DEAD_LETTERED,
            name,
            &message_id,
            &[
                ("error", serde_json::json!(error)),
                ("retry_count", serde_json::json!(retry_count)),
            ],
        ));
    }

    // ========================================================================
    // Dead-letter operations
    // ========================================================================

    pub(crate) async fn dead_letters(&self, name: &str) -> Result<Vec<DeadLetter<T>>> {
        let queue = self.registry.get(name).await?;
        Ok(queue.dead_letters().list().await)
    }

    /// Move a dead letter back into its queue with a fresh retry budget
    pub(crate) async fn retry_dead_letter(&self, name: &str, message_id: &str) -> Result<bool> {
        self.ensure_running()?;
        let queue = self.registry.get(name).await?;

        let Some(letter) = queue.dead_letters().remove(message_id).await else {
            return Ok(false);
        };

        let mut message = letter.message;
        message.reset_retry();
        queue.push(message).await;

        self.metrics.increment(name, Counter::DeadLetterRetried);
        tracing::info!(
            queue = %name,
            message_id = %message_id,
            "a3s.relay.dlq: dead letter replayed"
        );
        self.events.emit(QueueEvent::for_message(
            events::DEAD_LETTER_RETRIED,
            name,
            message_id,
            &[],
        ));
        Ok(true)
    }

    /// Purge dead letters older than the TTL from every queue and from persistence
    ///
    /// Letters are removed from the store even when their persistence delete
    /// fails; the failures are reported in the returned error.
    pub(crate) async fn sweep_dead_letters(&self) -> Result<usize> {
        let ttl = self.config.dead_letter_ttl;
        let mut expired_total = 0;
        let mut delete_failures = 0;

        for queue in self.registry.all().await {
            let name = queue.name();
            for letter in queue.dead_letters().remove_expired(ttl).await {
                expired_total += 1;
                if let Err(err) = self.persistence.delete(name, &letter.message.id).await {
                    delete_failures += 1;
                    self.metrics.increment(name, Counter::PersistenceErrors);
                    tracing::warn!(
                        queue = %name,
                        message_id = %letter.message.id,
                        error = %err,
                        "a3s.relay.dlq: failed to purge expired dead letter"
                    );
                }

                self.metrics.increment(name, Counter::DeadLetterExpired);
                self.events.emit(QueueEvent::for_message(
                    events::DEAD_LETTER_EXPIRED,
                    name,
                    &letter.message.id,
                    &[],
                ));
            }
        }

        if expired_total > 0 {
            tracing::info!(
                expired = expired_total,
                ttl_ms = ttl.as_millis() as u64,
                "a3s.relay.dlq: expired dead letters purged"
            );
        }

        if delete_failures > 0 {
            return Err(RelayError::Persistence(format!(
                "{} of {} expired dead letters could not be deleted",
                delete_failures, expired_total
            )));
        }
        Ok(expired_total)
    }

    // ========================================================================
    // Recovery and introspection
    // ========================================================================

    /// Re-enqueue everything persistence still holds for each known queue
    pub(crate) async fn recover(&self) -> Result<usize> {
        self.ensure_running()?;
        let mut recovered = 0;

        for queue in self.registry.all().await {
            let messages = self
                .persistence
                .load(queue.name())
                .await
                .map_err(as_persistence_error)?;
            let count = messages.len();
            for message in messages {
                queue.push(message).await;
            }

            if count > 0 {
                tracing::info!(
                    queue = %queue.name(),
                    recovered = count,
                    "a3s.relay.recovery: re-enqueued persisted messages"
                );
            }
            recovered += count;
        }
        Ok(recovered)
    }

    pub(crate) async fn stats(&self) -> QueueStats {
        let mut queues = HashMap::new();
        let mut total_ready = 0;
        let mut dead_letter_count = 0;

        for queue in self.registry.all().await {
            let status = QueueStatus {
                ready: queue.len().await,
                capacity: queue.capacity(),
                dead_letters: queue.dead_letters().len().await,
                has_handler: queue.has_handler().await,
            };
            total_ready += status.ready;
            dead_letter_count += status.dead_letters;
            queues.insert(queue.name().to_string(), status);
        }

        QueueStats {
            total_ready,
            dead_letter_count,
            queues,
        }
    }

    pub(crate) async fn queue_names(&self) -> Vec<String> {
        self.registry.names().await
    }

    pub(crate) fn active_tasks(&self) -> usize {
        self.scheduler.active_tasks()
    }
}
