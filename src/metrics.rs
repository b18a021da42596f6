//! Per-queue counters for queue observability.
//!
//! Counters are plain `AtomicU64`s kept per queue in a `DashMap`, so recording
//! never awaits and never takes a queue lock. [`QueueMetrics::snapshot`] copies
//! them into a serializable [`MetricsSnapshot`].

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::message::QueueName;

/// Standard metric names
pub mod metric_names {
    /// Counter: messages accepted by `send`
    pub const MESSAGES_SENT: &str = "relay.messages.sent";
    /// Counter: handler invocations that succeeded
    pub const MESSAGES_PROCESSED: &str = "relay.messages.processed";
    /// Counter: handler invocations that failed (error, panic or timeout)
    pub const MESSAGES_FAILED: &str = "relay.messages.failed";
    /// Counter: retries that re-entered the queue
    pub const MESSAGES_RETRIED: &str = "relay.messages.retried";
    /// Counter: messages moved to the dead-letter store
    pub const MESSAGES_DEAD_LETTERED: &str = "relay.messages.dead_lettered";
    /// Counter: dead letters replayed by hand
    pub const DEAD_LETTERS_RETRIED: &str = "relay.dead_letters.retried";
    /// Counter: dead letters purged by the expiry sweep
    pub const DEAD_LETTERS_EXPIRED: &str = "relay.dead_letters.expired";
    /// Counter: failed persist/delete calls
    pub const PERSISTENCE_ERRORS: &str = "relay.persistence.errors";
    /// Counter: failed expiry sweeps
    pub const SWEEP_ERRORS: &str = "relay.sweep.errors";
}

/// Per-queue counter kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Sent,
    Processed,
    Failed,
    Retried,
    DeadLettered,
    DeadLetterRetried,
    DeadLetterExpired,
    PersistenceErrors,
}

impl Counter {
    /// Metric name reported for this counter
    pub fn metric_name(self) -> &'static str {
        match self {
            Counter::Sent => metric_names::MESSAGES_SENT,
            Counter::Processed => metric_names::MESSAGES_PROCESSED,
            Counter::Failed => metric_names::MESSAGES_FAILED,
            Counter::Retried => metric_names::MESSAGES_RETRIED,
            Counter::DeadLettered => metric_names::MESSAGES_DEAD_LETTERED,
            Counter::DeadLetterRetried => metric_names::DEAD_LETTERS_RETRIED,
            Counter::DeadLetterExpired => metric_names::DEAD_LETTERS_EXPIRED,
            Counter::PersistenceErrors => metric_names::PERSISTENCE_ERRORS,
        }
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    sent: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    dead_letter_retried: AtomicU64,
    dead_letter_expired: AtomicU64,
    persistence_errors: AtomicU64,
}

impl QueueCounters {
    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Sent => &self.sent,
            Counter::Processed => &self.processed,
            Counter::Failed => &self.failed,
            Counter::Retried => &self.retried,
            Counter::DeadLettered => &self.dead_lettered,
            Counter::DeadLetterRetried => &self.dead_letter_retried,
            Counter::DeadLetterExpired => &self.dead_letter_expired,
            Counter::PersistenceErrors => &self.persistence_errors,
        }
    }

    fn reset(&self) {
        for counter in [
            &self.sent,
            &self.processed,
            &self.failed,
            &self.retried,
            &self.dead_lettered,
            &self.dead_letter_retried,
            &self.dead_letter_expired,
            &self.persistence_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> QueueCounterSnapshot {
        QueueCounterSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dead_letter_retried: self.dead_letter_retried.load(Ordering::Relaxed),
            dead_letter_expired: self.dead_letter_expired.load(Ordering::Relaxed),
            persistence_errors: self.persistence_errors.load(Ordering::Relaxed),
        }
    }
}

/// Counter values of one queue at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounterSnapshot {
    pub sent: u64,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub dead_letter_retried: u64,
    pub dead_letter_expired: u64,
    pub persistence_errors: u64,
}

impl QueueCounterSnapshot {
    fn accumulate(&mut self, other: &QueueCounterSnapshot) {
        self.sent += other.sent;
        self.processed += other.processed;
        self.failed += other.failed;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.dead_letter_retried += other.dead_letter_retried;
        self.dead_letter_expired += other.dead_letter_expired;
        self.persistence_errors += other.persistence_errors;
    }
}

/// Snapshot of all counters at a point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Counters keyed by queue name
    pub queues: HashMap<QueueName, QueueCounterSnapshot>,
    /// Expiry sweeps that failed
    pub sweep_errors: u64,
}

impl MetricsSnapshot {
    /// Counters of one queue (all zero if the queue never recorded anything)
    pub fn queue(&self, name: &str) -> QueueCounterSnapshot {
        self.queues.get(name).copied().unwrap_or_default()
    }

    /// Counters summed over every queue
    pub fn total(&self) -> QueueCounterSnapshot {
        let mut total = QueueCounterSnapshot::default();
        for counters in self.queues.values() {
            total.accumulate(counters);
        }
        total
    }
}

/// Queue metrics collector
///
/// Cheap to clone; clones record into the same counters.
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    queues: Arc<DashMap<QueueName, Arc<QueueCounters>>>,
    sweep_errors: Arc<AtomicU64>,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, queue: &str) -> Arc<QueueCounters> {
        if let Some(counters) = self.queues.get(queue) {
            return Arc::clone(&counters);
        }
        Arc::clone(&self.queues.entry(queue.to_string()).or_default())
    }

    /// Register a queue so it shows up in snapshots before its first event
    pub fn register_queue(&self, queue: &str) {
        self.counters(queue);
    }

    /// Add one to a queue counter
    pub fn increment(&self, queue: &str, counter: Counter) {
        self.add(queue, counter, 1);
    }

    /// Add `value` to a queue counter
    pub fn add(&self, queue: &str, counter: Counter, value: u64) {
        if value == 0 {
            return;
        }
        self.counters(queue)
            .slot(counter)
            .fetch_add(value, Ordering::Relaxed);

        #[cfg(feature = "telemetry")]
        crate::telemetry::record_counter(counter, queue, value);
    }

    /// Count a failed expiry sweep
    pub fn record_sweep_error(&self) {
        self.sweep_errors.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "telemetry")]
        crate::telemetry::record_sweep_error();
    }

    /// Current value of a single queue counter
    pub fn get(&self, queue: &str, counter: Counter) -> u64 {
        self.queues
            .get(queue)
            .map_or(0, |c| c.slot(counter).load(Ordering::Relaxed))
    }

    /// Copy every counter into a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let queues = self
            .queues
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();

        MetricsSnapshot {
            queues,
            sweep_errors: self.sweep_errors.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter (registered queues stay registered)
    pub fn reset(&self) {
        for entry in self.queues.iter() {
            entry.value().reset();
        }
        self.sweep_errors.store(0, Ordering::Relaxed);
    }
}
