//! Dead-letter store for permanently failed messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::message::{Message, MessageId};

/// A message that exhausted its retries, or arrived at a queue with no handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter<T> {
    /// The message in its final state
    pub message: Message<T>,
    /// Rendered error that caused dead-lettering
    pub error: String,
    /// Timestamp when the message was dead-lettered
    pub dead_lettered_at: DateTime<Utc>,
}

impl<T> DeadLetter<T> {
    /// Create a dead letter stamped with the current time
    pub fn new(message: Message<T>, error: impl Into<String>) -> Self {
        Self {
            message,
            error: error.into(),
            dead_lettered_at: Utc::now(),
        }
    }

    /// ID of the wrapped message
    pub fn message_id(&self) -> &str {
        &self.message.id
    }
}

/// Per-queue dead-letter store
///
/// Bounded by `capacity`: inserting past it evicts the entry with the oldest
/// `dead_lettered_at`. Clones share the same underlying map.
pub struct DeadLetterStore<T> {
    letters: Arc<Mutex<HashMap<MessageId, DeadLetter<T>>>>,
    capacity: usize,
}

impl<T> Clone for DeadLetterStore<T> {
    fn clone(&self) -> Self {
        Self {
            letters: Arc::clone(&self.letters),
            capacity: self.capacity,
        }
    }
}

impl<T: Clone> DeadLetterStore<T> {
    /// Create a store holding at most `capacity` letters (minimum 1)
    pub fn new(capacity: usize) -> Self {
        Self {
            letters: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Maximum number of letters kept
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert a dead letter, returning the entry evicted to make room (if any)
    pub async fn push(&self, letter: DeadLetter<T>) -> Option<DeadLetter<T>> {
        let mut letters = self.letters.lock().await;

        let mut evicted = None;
        if !letters.contains_key(&letter.message.id) && letters.len() >= self.capacity {
            let oldest = letters
                .values()
                .min_by_key(|l| l.dead_lettered_at)
                .map(|l| l.message.id.clone());
            if let Some(id) = oldest {
                evicted = letters.remove(&id);
            }
        }

        letters.insert(letter.message.id.clone(), letter);
        evicted
    }

    /// Remove a dead letter by message ID
    pub async fn remove(&self, message_id: &str) -> Option<DeadLetter<T>> {
        let mut letters = self.letters.lock().await;
        letters.remove(message_id)
    }

    /// Look up a dead letter by message ID (returns a copy)
    pub async fn get(&self, message_id: &str) -> Option<DeadLetter<T>> {
        let letters = self.letters.lock().await;
        letters.get(message_id).cloned()
    }

    /// Remove and return every letter older than `ttl`, oldest first
    pub async fn remove_expired(&self, ttl: Duration) -> Vec<DeadLetter<T>> {
        let threshold = match chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        {
            Some(threshold) => threshold,
            // TTL reaches before the epoch of representable time: nothing is that old
            None => return Vec::new(),
        };

        let mut letters = self.letters.lock().await;
        let expired_ids: Vec<MessageId> = letters
            .values()
            .filter(|l| l.dead_lettered_at < threshold)
            .map(|l| l.message.id.clone())
            .collect();

        let mut expired: Vec<DeadLetter<T>> = expired_ids
            .iter()
            .filter_map(|id| letters.remove(id))
            .collect();
        expired.sort_by_key(|l| l.dead_lettered_at);
        expired
    }

    /// List all dead letters oldest first (returns a copy)
    pub async fn list(&self) -> Vec<DeadLetter<T>> {
        let letters = self.letters.lock().await;
        let mut list: Vec<DeadLetter<T>> = letters.values().cloned().collect();
        list.sort_by_key(|l| l.dead_lettered_at);
        list
    }

    /// Clear all dead letters
    pub async fn clear(&self) {
        let mut letters = self.letters.lock().await;
        letters.clear();
    }

    /// Get the number of dead letters
    pub async fn len(&self) -> usize {
        let letters = self.letters.lock().await;
        letters.len()
    }

    /// Check if the store is empty
    pub async fn is_empty(&self) -> bool {
        let letters = self.letters.lock().await;
        letters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_dead_letter(payload: &str, error: &str, age: chrono::Duration) -> DeadLetter<String> {
        let mut letter = DeadLetter::new(Message::new(payload.to_string(), 0), error);
        letter.dead_lettered_at = Utc::now() - age;
        letter
    }

    #[tokio::test]
    async fn test_store_new() {
        let store: DeadLetterStore<String> = DeadLetterStore::new(100);
        assert_eq!(store.capacity(), 100);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_store_zero_capacity_holds_one() {
        let store: DeadLetterStore<String> = DeadLetterStore::new(0);
        assert_eq!(store.capacity(), 1);
    }

    #[tokio::test]
    async fn test_push_and_len() {
        let store = DeadLetterStore::new(10);

        assert!(store
            .push(make_dead_letter("a", "boom", chrono::Duration::zero()))
            .await
            .is_none());
        assert_eq!(store.len().await, 1);

        store
            .push(make_dead_letter("b", "boom", chrono::Duration::zero()))
            .await;
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_evicts_oldest_by_timestamp() {
        let store = DeadLetterStore::new(3);

        // Inserted out of age order on purpose
        let middle = make_dead_letter("middle", "e", chrono::Duration::minutes(5));
        let oldest = make_dead_letter("oldest", "e", chrono::Duration::minutes(10));
        let newest = make_dead_letter("newest", "e", chrono::Duration::minutes(1));
        let oldest_id = oldest.message.id.clone();

        store.push(middle).await;
        store.push(oldest).await;
        store.push(newest).await;

        let evicted = store
            .push(make_dead_letter("fresh", "e", chrono::Duration::zero()))
            .await
            .expect("store at capacity should evict");
        assert_eq!(evicted.message.id, oldest_id);
        assert_eq!(store.len().await, 3);

        let payloads: Vec<String> = store
            .list()
            .await
            .into_iter()
            .map(|l| l.message.payload)
            .collect();
        assert_eq!(payloads, vec!["middle", "newest", "fresh"]);
    }

    #[tokio::test]
    async fn test_reinsert_same_id_does_not_evict() {
        let store = DeadLetterStore::new(1);
        let letter = make_dead_letter("a", "first", chrono::Duration::zero());

        store.push(letter.clone()).await;
        let mut again = letter.clone();
        again.error = "second".to_string();
        assert!(store.push(again).await.is_none());

        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(&letter.message.id).await.unwrap().error, "second");
    }

    #[tokio::test]
    async fn test_remove() {
        let store = DeadLetterStore::new(10);
        let letter = make_dead_letter("a", "boom", chrono::Duration::zero());
        let id = letter.message.id.clone();
        store.push(letter).await;

        let removed = store.remove(&id).await.unwrap();
        assert_eq!(removed.message.payload, "a");
        assert!(store.is_empty().await);
        assert!(store.remove(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_expired() {
        let store = DeadLetterStore::new(10);
        store
            .push(make_dead_letter("old", "e", chrono::Duration::hours(30)))
            .await;
        store
            .push(make_dead_letter("older", "e", chrono::Duration::hours(48)))
            .await;
        store
            .push(make_dead_letter("recent", "e", chrono::Duration::hours(1)))
            .await;

        let expired = store.remove_expired(Duration::from_secs(24 * 3600)).await;
        let payloads: Vec<&str> = expired.iter().map(|l| l.message.payload.as_str()).collect();
        assert_eq!(payloads, vec!["older", "old"]);

        let remaining = store.list().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].message.payload, "recent");
    }

    #[tokio::test]
    async fn test_remove_expired_huge_ttl() {
        let store = DeadLetterStore::new(10);
        store
            .push(make_dead_letter("a", "e", chrono::Duration::days(365)))
            .await;

        let expired = store.remove_expired(Duration::MAX).await;
        assert!(expired.is_empty());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_list_is_oldest_first() {
        let store = DeadLetterStore::new(10);
        store
            .push(make_dead_letter("2", "e", chrono::Duration::seconds(2)))
            .await;
        store
            .push(make_dead_letter("3", "e", chrono::Duration::seconds(1)))
            .await;
        store
            .push(make_dead_letter("1", "e", chrono::Duration::seconds(3)))
            .await;

        let list = store.list().await;
        let payloads: Vec<&str> = list.iter().map(|l| l.message.payload.as_str()).collect();
        assert_eq!(payloads, vec!["1", "2", "3"]);
        // list must not remove items
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_clear() {
        let store = DeadLetterStore::new(10);
        store
            .push(make_dead_letter("a", "e", chrono::Duration::zero()))
            .await;
        store.clear().await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_store_clone_shares_data() {
        let store1 = DeadLetterStore::new(10);
        store1
            .push(make_dead_letter("a", "e", chrono::Duration::zero()))
            .await;

        let store2 = store1.clone();
        store2
            .push(make_dead_letter("b", "e", chrono::Duration::zero()))
            .await;
        assert_eq!(store1.len().await, 2);
        assert_eq!(store2.len().await, 2);
    }

    #[test]
    fn test_dead_letter_serialization() {
        let letter = make_dead_letter("payload", "Handler execution error: boom", chrono::Duration::zero());
        let json = serde_json::to_string(&letter).unwrap();
        let parsed: DeadLetter<String> = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.message_id(), letter.message_id());
        assert_eq!(parsed.error, "Handler execution error: boom");
        assert_eq!(parsed.dead_lettered_at, letter.dead_lettered_at);
    }
}
