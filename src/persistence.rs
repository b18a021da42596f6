//! Persistence hook for at-least-once delivery
//!
//! Every message is handed to [`MessagePersistence::persist`] before it becomes
//! visible to a dispatcher, and removed with [`MessagePersistence::delete`] once
//! its handler succeeds (or once it is purged from the dead-letter store).
//! Whatever is still persisted after a crash can be fed back through
//! [`MessagePersistence::load`].
//!
//! Three adapters ship with the crate:
//! - [`NoopPersistence`]: accepts everything, stores nothing (the default)
//! - [`MemoryPersistence`]: in-process map, useful in tests
//! - [`LocalPersistence`]: one JSON file per queue under a directory

use crate::error::{RelayError, Result};
use crate::message::{Message, MessageId, Payload, QueueName};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

/// Durable storage contract for in-flight messages
#[async_trait]
pub trait MessagePersistence<T: Payload>: Send + Sync {
    /// Store a message before it is enqueued
    async fn persist(&self, queue: &str, message: &Message<T>) -> Result<()>;

    /// Forget a message that was processed or purged
    async fn delete(&self, queue: &str, message_id: &str) -> Result<()>;

    /// Every message still stored for `queue`
    async fn load(&self, _queue: &str) -> Result<Vec<Message<T>>> {
        Ok(Vec::new())
    }
}

/// Persistence that stores nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPersistence;

#[async_trait]
impl<T: Payload> MessagePersistence<T> for NoopPersistence {
    async fn persist(&self, _queue: &str, _message: &Message<T>) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _queue: &str, _message_id: &str) -> Result<()> {
        Ok(())
    }
}

type QueueMessages<T> = HashMap<MessageId, Message<T>>;

fn sorted_by_creation<T: Clone>(messages: &QueueMessages<T>) -> Vec<Message<T>> {
    let mut list: Vec<Message<T>> = messages.values().cloned().collect();
    list.sort_by_key(|m| m.created_at);
    list
}

/// In-memory persistence keyed by queue and message ID
pub struct MemoryPersistence<T> {
    messages: RwLock<HashMap<QueueName, QueueMessages<T>>>,
}

impl<T> Default for MemoryPersistence<T> {
    fn default() -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Payload> MemoryPersistence<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages stored for `queue`
    pub async fn len(&self, queue: &str) -> usize {
        let messages = self.messages.read().await;
        messages.get(queue).map_or(0, HashMap::len)
    }

    /// Whether a message is currently stored
    pub async fn contains(&self, queue: &str, message_id: &str) -> bool {
        let messages = self.messages.read().await;
        messages
            .get(queue)
            .is_some_and(|q| q.contains_key(message_id))
    }

    /// Total number of stored messages across all queues
    pub async fn total(&self) -> usize {
        let messages = self.messages.read().await;
        messages.values().map(HashMap::len).sum()
    }
}

#[async_trait]
impl<T: Payload> MessagePersistence<T> for MemoryPersistence<T> {
    async fn persist(&self, queue: &str, message: &Message<T>) -> Result<()> {
        let mut messages = self.messages.write().await;
        messages
            .entry(queue.to_string())
            .or_default()
            .insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn delete(&self, queue: &str, message_id: &str) -> Result<()> {
        let mut messages = self.messages.write().await;
        if let Some(q) = messages.get_mut(queue) {
            q.remove(message_id);
        }
        Ok(())
    }

    async fn load(&self, queue: &str) -> Result<Vec<Message<T>>> {
        let messages = self.messages.read().await;
        Ok(messages.get(queue).map(sorted_by_creation).unwrap_or_default())
    }
}

/// Local filesystem persistence: one JSON file per queue under a directory
///
/// Files are named `queue-<hex of the queue name>.json`, so every queue name
/// maps to its own file and nothing can escape the directory.
pub struct LocalPersistence<T> {
    /// Directory path for queue files
    storage_dir: PathBuf,
    /// Cache of every queue file touched so far; the lock is held across
    /// file writes so concurrent updates to one queue never interleave
    cache: Mutex<HashMap<QueueName, QueueMessages<T>>>,
}

impl<T> LocalPersistence<T>
where
    T: Payload + Serialize + DeserializeOwned,
{
    /// Create a LocalPersistence rooted at `storage_dir`
    ///
    /// The directory will be created if it doesn't exist.
    pub async fn new(storage_dir: impl Into<PathBuf>) -> Result<Self> {
        let storage_dir = storage_dir.into();
        fs::create_dir_all(&storage_dir).await.map_err(|e| {
            RelayError::Persistence(format!("Failed to create storage directory: {}", e))
        })?;

        Ok(Self {
            storage_dir,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding the queue files
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn queue_path(&self, queue: &str) -> PathBuf {
        self.storage_dir
            .join(format!("queue-{}.json", hex::encode(queue.as_bytes())))
    }

    async fn read_queue_file(&self, queue: &str) -> Result<QueueMessages<T>> {
        let path = self.queue_path(queue);
        let data = match fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => {
                return Err(RelayError::Persistence(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let messages: Vec<Message<T>> = serde_json::from_str(&data).map_err(|e| {
            RelayError::Persistence(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        Ok(messages.into_iter().map(|m| (m.id.clone(), m)).collect())
    }

    async fn write_queue_file(&self, queue: &str, messages: &QueueMessages<T>) -> Result<()> {
        let json = serde_json::to_string_pretty(&sorted_by_creation(messages))
            .map_err(|e| RelayError::Persistence(format!("Failed to serialize messages: {}", e)))?;

        fs::write(self.queue_path(queue), json)
            .await
            .map_err(|e| RelayError::Persistence(format!("Failed to write queue file: {}", e)))
    }

    /// Apply `update` to a copy of the queue's messages, write it, then cache it
    ///
    /// The cache only changes once the file write succeeded.
    async fn update_queue<F>(&self, queue: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut QueueMessages<T>) -> bool + Send,
    {
        let mut cache = self.cache.lock().await;
        let mut messages = match cache.get(queue) {
            Some(cached) => cached.clone(),
            None => self.read_queue_file(queue).await?,
        };

        if update(&mut messages) {
            self.write_queue_file(queue, &messages).await?;
        }
        cache.insert(queue.to_string(), messages);
        Ok(())
    }
}

#[async_trait]
impl<T> MessagePersistence<T> for LocalPersistence<T>
where
    T: Payload + Serialize + DeserializeOwned,
{
    async fn persist(&self, queue: &str, message: &Message<T>) -> Result<()> {
        let message = message.clone();
        self.update_queue(queue, move |messages| {
            messages.insert(message.id.clone(), message);
            true
        })
        .await
    }

    async fn delete(&self, queue: &str, message_id: &str) -> Result<()> {
        self.update_queue(queue, |messages| messages.remove(message_id).is_some())
            .await
    }

    async fn load(&self, queue: &str) -> Result<Vec<Message<T>>> {
        let mut cache = self.cache.lock().await;
        if let Some(messages) = cache.get(queue) {
            return Ok(sorted_by_creation(messages));
        }

        let loaded = self.read_queue_file(queue).await?;
        let list = sorted_by_creation(&loaded);
        cache.insert(queue.to_string(), loaded);
        Ok(list)
    }
}
