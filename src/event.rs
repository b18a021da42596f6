//! Event system for queue notifications

use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast;

/// Event key type
pub type EventKey = String;

/// Event payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Empty,
    String(String),
    Map(HashMap<String, serde_json::Value>),
}

impl EventPayload {
    /// Look up a field of a map payload
    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        match self {
            EventPayload::Map(map) => map.get(field),
            _ => None,
        }
    }
}

/// Queue lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    /// Event key (e.g., "queue.message.sent", "queue.message.dead_lettered")
    pub key: EventKey,

    /// Event payload
    pub payload: EventPayload,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl QueueEvent {
    /// Create a new event
    pub fn new(key: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            key: key.into(),
            payload,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create an event with no payload
    pub fn empty(key: impl Into<String>) -> Self {
        Self::new(key, EventPayload::Empty)
    }

    /// Create an event with a string payload
    pub fn with_string(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(key, EventPayload::String(message.into()))
    }

    /// Create an event with a map payload
    pub fn with_map(key: impl Into<String>, map: HashMap<String, serde_json::Value>) -> Self {
        Self::new(key, EventPayload::Map(map))
    }

    /// Create an event about one message: `{"queue": .., "message_id": .., ..extra}`
    pub fn for_message(
        key: impl Into<String>,
        queue: &str,
        message_id: &str,
        extra: &[(&str, serde_json::Value)],
    ) -> Self {
        let mut map = HashMap::new();
        map.insert("queue".to_string(), serde_json::json!(queue));
        map.insert("message_id".to_string(), serde_json::json!(message_id));
        for (field, value) in extra {
            map.insert(field.to_string(), value.clone());
        }
        Self::with_map(key, map)
    }

    /// Create an event about a queue: `{"queue": ..}`
    pub fn for_queue(key: impl Into<String>, queue: &str) -> Self {
        let mut map = HashMap::new();
        map.insert("queue".to_string(), serde_json::json!(queue));
        Self::with_map(key, map)
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<QueueEvent>>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event (dropped when nobody is subscribed)
    pub fn emit(&self, event: QueueEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to filtered events as an `EventStream` (implements `Stream`)
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&QueueEvent) -> bool + Send + Sync + 'static,
    ) -> EventStream {
        use tokio_stream::wrappers::BroadcastStream;
        use tokio_stream::StreamExt as TokioStreamExt;
        let stream = BroadcastStream::new(self.sender.subscribe())
            .filter_map(|r: Result<QueueEvent, _>| r.ok())
            .filter(move |e| filter(e));
        EventStream {
            inner: Box::pin(stream),
        }
    }

    /// Subscribe to all events as an `EventStream` (implements `Stream`)
    pub fn subscribe_stream(&self) -> EventStream {
        self.subscribe_filtered(|_| true)
    }
}

/// Event stream implementing `futures_core::Stream<Item = QueueEvent>`.
///
/// Lagging subscribers silently skip the events they missed.
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = QueueEvent> + Send>>,
}

impl Stream for EventStream {
    type Item = QueueEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl EventStream {
    /// Receive the next matching event
    pub async fn recv(&mut self) -> Option<QueueEvent> {
        use tokio_stream::StreamExt;
        self.next().await
    }
}

/// Event catalog - predefined event keys
pub mod events {
    // Queue lifecycle
    pub const QUEUE_CREATED: &str = "queue.created";
    pub const QUEUE_HANDLER_REGISTERED: &str = "queue.handler.registered";
    pub const QUEUE_SHUTDOWN_STARTED: &str = "queue.shutdown.started";
    pub const QUEUE_SHUTDOWN_COMPLETE: &str = "queue.shutdown.complete";

    // Message flow
    pub const MESSAGE_SENT: &str = "queue.message.sent";
    pub const MESSAGE_PROCESSED: &str = "queue.message.processed";
    pub const MESSAGE_FAILED: &str = "queue.message.failed";
    pub const MESSAGE_RETRY_SCHEDULED: &str = "queue.message.retry_scheduled";
    pub const MESSAGE_RETRIED: &str = "queue.message.retried";
    pub const MESSAGE_DEAD_LETTERED: &str = "queue.message.dead_lettered";

    // Dead-letter store
    pub const DEAD_LETTER_RETRIED: &str = "queue.dead_letter.retried";
    pub const DEAD_LETTER_EXPIRED: &str = "queue.dead_letter.expired";
    pub const DEAD_LETTER_EVICTED: &str = "queue.dead_letter.evicted";
}
