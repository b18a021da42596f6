//! Message envelope carried through the queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue name
pub type QueueName = String;

/// Message identifier
pub type MessageId = String;

/// Message priority (higher number = serviced first)
pub type Priority = i32;

/// Marker for types that can travel through a [`MessageQueue`](crate::MessageQueue).
///
/// Payloads are cloned when handed to a handler task and when dead letters are
/// listed, and they cross task boundaries.
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Payload for T {}

/// A payload wrapped with identity, priority and delivery bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message<T> {
    /// Unique message ID, generated at send time
    pub id: MessageId,
    /// User payload
    pub payload: T,
    /// Delivery priority
    pub priority: Priority,
    /// Timestamp when the message was sent
    pub created_at: DateTime<Utc>,
    /// Number of retries scheduled so far
    pub retry_count: u32,
}

impl<T> Message<T> {
    /// Create a new message with a fresh ID and the current timestamp
    pub fn new(payload: T, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            priority,
            created_at: Utc::now(),
            retry_count: 0,
        }
    }

    /// Bump the retry counter, returning the new attempt number
    pub(crate) fn increment_retry(&mut self) -> u32 {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count
    }

    /// Reset the retry counter (manual dead-letter replay)
    pub(crate) fn reset_retry(&mut self) {
        self.retry_count = 0;
    }
}
