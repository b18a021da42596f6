//! Named priority queues and the registry that owns them

use crate::dlq::DeadLetterStore;
use crate::error::{RelayError, Result};
use crate::message::{Message, Payload, Priority, QueueName};
use async_trait::async_trait;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;

/// Consumer of a queue's payloads
///
/// Returning an error (or panicking) marks the delivery as failed and hands the
/// message to the retry policy. Handlers may see the same payload more than once.
#[async_trait]
pub trait MessageHandler<T: Payload>: Send + Sync {
    async fn handle(&self, payload: &T) -> anyhow::Result<()>;
}

#[async_trait]
impl<T, F> MessageHandler<T> for F
where
    T: Payload,
    F: Fn(&T) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, payload: &T) -> anyhow::Result<()> {
        (self)(payload)
    }
}

/// Adapter for async closures that take the payload by value
///
/// ```rust,ignore
/// queue
///     .register_handler("emails", AsyncHandler(|email: Email| async move {
///         mailer.send(email).await
///     }))
///     .await?;
/// ```
pub struct AsyncHandler<F>(pub F);

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for AsyncHandler<F>
where
    T: Payload,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, payload: &T) -> anyhow::Result<()> {
        (self.0)(payload.clone()).await
    }
}

/// Heap entry: higher priority first, then lower sequence number (FIFO)
struct ReadyEntry<T> {
    priority: Priority,
    seq: u64,
    message: Message<T>,
}

impl<T> PartialEq for ReadyEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for ReadyEntry<T> {}

impl<T> PartialOrd for ReadyEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for ReadyEntry<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct ReadyHeap<T> {
    heap: BinaryHeap<ReadyEntry<T>>,
    next_seq: u64,
}

impl<T> ReadyHeap<T> {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    fn push(&mut self, message: Message<T>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(ReadyEntry {
            priority: message.priority,
            seq,
            message,
        });
    }

    fn pop(&mut self) -> Option<Message<T>> {
        self.heap.pop().map(|entry| entry.message)
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

/// A named queue: priority-ordered ready messages, a handler slot and a
/// dead-letter store sized like the queue
pub struct NamedQueue<T: Payload> {
    name: QueueName,
    capacity: usize,
    ready: Mutex<ReadyHeap<T>>,
    message_ready: Notify,
    space_available: Notify,
    handler: RwLock<Option<Arc<dyn MessageHandler<T>>>>,
    dead_letters: DeadLetterStore<T>,
    dispatcher_running: AtomicBool,
}

impl<T: Payload> NamedQueue<T> {
    pub fn new(name: impl Into<QueueName>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            ready: Mutex::new(ReadyHeap::new()),
            message_ready: Notify::new(),
            space_available: Notify::new(),
            handler: RwLock::new(None),
            dead_letters: DeadLetterStore::new(capacity),
            dispatcher_running: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dead_letters(&self) -> &DeadLetterStore<T> {
        &self.dead_letters
    }

    /// Enqueue respecting capacity, waiting up to `timeout` for room
    ///
    /// Hands the message back if the queue stayed full.
    pub async fn offer(
        &self,
        message: Message<T>,
        timeout: Duration,
    ) -> std::result::Result<(), Message<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            // Register before checking so a pop between the check and the wait is not missed
            notified.as_mut().enable();

            {
                let mut ready = self.ready.lock().await;
                if ready.len() < self.capacity {
                    ready.push(message);
                    drop(ready);
                    self.message_ready.notify_one();
                    return Ok(());
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(message);
            }
        }
    }

    /// Enqueue ignoring capacity (retries, replays and recovery)
    pub async fn push(&self, message: Message<T>) {
        let mut ready = self.ready.lock().await;
        ready.push(message);
        drop(ready);
        self.message_ready.notify_one();
    }

    /// Dequeue the highest-priority message, waiting up to `timeout` for one
    pub async fn poll(&self, timeout: Duration) -> Option<Message<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.message_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_poll().await {
                return Some(message);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Dequeue the highest-priority message without waiting
    pub async fn try_poll(&self) -> Option<Message<T>> {
        let mut ready = self.ready.lock().await;
        let message = ready.pop();
        drop(ready);
        if message.is_some() {
            self.space_available.notify_one();
        }
        message
    }

    /// Number of ready messages
    pub async fn len(&self) -> usize {
        self.ready.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Install a handler, replacing any previous one
    pub async fn set_handler(&self, handler: Arc<dyn MessageHandler<T>>) {
        let mut slot = self.handler.write().await;
        *slot = Some(handler);
    }

    pub async fn handler(&self) -> Option<Arc<dyn MessageHandler<T>>> {
        self.handler.read().await.clone()
    }

    pub async fn has_handler(&self) -> bool {
        self.handler.read().await.is_some()
    }

    /// Claim the dispatcher slot; false if a dispatcher already runs
    pub(crate) fn claim_dispatcher(&self) -> bool {
        self.dispatcher_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_dispatcher(&self) {
        self.dispatcher_running.store(false, Ordering::Release);
    }
}

/// Name -> queue map; queues are created once and never removed
pub struct QueueRegistry<T: Payload> {
    queues: RwLock<HashMap<QueueName, Arc<NamedQueue<T>>>>,
}

impl<T: Payload> Default for QueueRegistry<T> {
    fn default() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Payload> QueueRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a queue; the flag is true when this call created it
    ///
    /// An existing queue keeps its original capacity.
    pub async fn create(&self, name: &str, capacity: usize) -> (Arc<NamedQueue<T>>, bool) {
        let mut queues = self.queues.write().await;
        if let Some(queue) = queues.get(name) {
            return (Arc::clone(queue), false);
        }
        let queue = Arc::new(NamedQueue::new(name, capacity));
        queues.insert(name.to_string(), Arc::clone(&queue));
        (queue, true)
    }

    pub async fn get(&self, name: &str) -> Result<Arc<NamedQueue<T>>> {
        let queues = self.queues.read().await;
        queues
            .get(name)
            .cloned()
            .ok_or_else(|| RelayError::QueueNotFound(name.to_string()))
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.queues.read().await.contains_key(name)
    }

    /// Queue names in sorted order
    pub async fn names(&self) -> Vec<QueueName> {
        let queues = self.queues.read().await;
        let mut names: Vec<QueueName> = queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every queue, sorted by name
    pub async fn all(&self) -> Vec<Arc<NamedQueue<T>>> {
        let queues = self.queues.read().await;
        let mut all: Vec<Arc<NamedQueue<T>>> = queues.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(payload: &str, priority: Priority) -> Message<String> {
        Message::new(payload.to_string(), priority)
    }

    async fn drain(queue: &NamedQueue<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(message) = queue.try_poll().await {
            out.push(message.payload);
        }
        out
    }

    #[tokio::test]
    async fn test_priority_order() {
        let queue = NamedQueue::new("q", 10);
        queue.push(msg("one", 1)).await;
        queue.push(msg("five", 5)).await;
        queue.push(msg("three", 3)).await;

        assert_eq!(drain(&queue).await, vec!["five", "three", "one"]);
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let queue = NamedQueue::new("q", 10);
        for payload in ["a", "b", "c"] {
            queue.push(msg(payload, 2)).await;
        }
        queue.push(msg("urgent", 9)).await;
        queue.push(msg("d", 2)).await;

        assert_eq!(drain(&queue).await, vec!["urgent", "a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_negative_priorities_sort_last() {
        let queue = NamedQueue::new("q", 10);
        queue.push(msg("low", -5)).await;
        queue.push(msg("normal", 0)).await;

        assert_eq!(drain(&queue).await, vec!["normal", "low"]);
    }

    #[tokio::test]
    async fn test_offer_respects_capacity() {
        let queue = NamedQueue::new("q", 2);
        assert!(queue.offer(msg("a", 0), Duration::ZERO).await.is_ok());
        assert!(queue.offer(msg("b", 0), Duration::ZERO).await.is_ok());

        let rejected = queue
            .offer(msg("c", 0), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(rejected.payload, "c");
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_offer_waits_for_space() {
        let queue = Arc::new(NamedQueue::new("q", 1));
        queue.offer(msg("a", 0), Duration::ZERO).await.unwrap();

        let consumer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            consumer.try_poll().await
        });

        assert!(queue
            .offer(msg("b", 0), Duration::from_secs(2))
            .await
            .is_ok());
        assert_eq!(drain(&queue).await, vec!["b"]);
    }

    #[tokio::test]
    async fn test_push_bypasses_capacity() {
        let queue = NamedQueue::new("q", 1);
        queue.push(msg("a", 0)).await;
        queue.push(msg("b", 0)).await;
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_poll_times_out_when_empty() {
        let queue: NamedQueue<String> = NamedQueue::new("q", 10);
        let started = std::time::Instant::now();
        assert!(queue.poll(Duration::from_millis(30)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_poll_wakes_on_push() {
        let queue = Arc::new(NamedQueue::new("q", 10));
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push(msg("late", 0)).await;
        });

        let message = queue.poll(Duration::from_secs(2)).await.unwrap();
        assert_eq!(message.payload, "late");
    }

    #[tokio::test]
    async fn test_handler_slot_replaces() {
        let queue: NamedQueue<String> = NamedQueue::new("q", 10);
        assert!(!queue.has_handler().await);

        queue
            .set_handler(Arc::new(|_: &String| -> anyhow::Result<()> {
                anyhow::bail!("first")
            }))
            .await;
        queue
            .set_handler(Arc::new(|_: &String| -> anyhow::Result<()> { Ok(()) }))
            .await;

        let handler = queue.handler().await.unwrap();
        assert!(handler.handle(&"x".to_string()).await.is_ok());
    }

    #[tokio::test]
    async fn test_async_handler_adapter() {
        let handler = AsyncHandler(|payload: String| async move {
            tokio::task::yield_now().await;
            if payload == "bad" {
                anyhow::bail!("rejected {}", payload);
            }
            Ok(())
        });

        assert!(handler.handle(&"good".to_string()).await.is_ok());
        let err = handler.handle(&"bad".to_string()).await.unwrap_err();
        assert_eq!(err.to_string(), "rejected bad");
    }

    #[tokio::test]
    async fn test_dead_letter_store_sized_like_queue() {
        let queue: NamedQueue<String> = NamedQueue::new("q", 7);
        assert_eq!(queue.dead_letters().capacity(), 7);
    }

    #[test]
    fn test_claim_dispatcher_once() {
        let queue: NamedQueue<String> = NamedQueue::new("q", 1);
        assert!(queue.claim_dispatcher());
        assert!(!queue.claim_dispatcher());
        queue.release_dispatcher();
        assert!(queue.claim_dispatcher());
    }

    #[tokio::test]
    async fn test_registry_create_is_idempotent() {
        let registry: QueueRegistry<String> = QueueRegistry::new();
        let (first, created) = registry.create("orders", 5).await;
        assert!(created);

        let (second, created) = registry.create("orders", 50).await;
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.capacity(), 5);
    }

    #[tokio::test]
    async fn test_registry_get_unknown() {
        let registry: QueueRegistry<String> = QueueRegistry::new();
        let result = registry.get("missing").await;
        assert!(matches!(result, Err(RelayError::QueueNotFound(name)) if name == "missing"));
    }

    #[tokio::test]
    async fn test_registry_names_sorted() {
        let registry: QueueRegistry<String> = QueueRegistry::new();
        registry.create("zeta", 1).await;
        registry.create("alpha", 1).await;

        assert_eq!(registry.names().await, vec!["alpha", "zeta"]);
        let all = registry.all().await;
        assert_eq!(all[0].name(), "alpha");
        assert!(registry.contains("zeta").await);
    }
}
