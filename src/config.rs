//! Queue configuration types

use crate::error::{RelayError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name of the queue that exists from construction
pub const DEFAULT_QUEUE: &str = "default";

/// Message queue configuration
///
/// Every field has a default, so a partial TOML document is enough:
///
/// ```toml
/// worker_threads = 4
/// send_timeout = 250
///
/// [retry_policy]
/// max_retries = 5
/// initial_delay = 200
/// multiplier = 2.0
/// ```
///
/// Durations are expressed in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MessageQueueConfig {
    /// Size of the worker pool shared by every queue's handlers
    pub worker_threads: usize,
    /// Capacity of the `"default"` queue (and its dead-letter store)
    pub default_queue_capacity: usize,
    /// Retry policy applied to handler failures
    pub retry_policy: RetryPolicy,
    /// How long a dispatcher waits for a message before re-checking shutdown
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// How long `send` waits for room in a full queue
    #[serde(with = "duration_ms")]
    pub send_timeout: Duration,
    /// Upper bound for a single handler invocation (`None` = unbounded)
    ///
    /// A running handler holds a worker permit; with no bound, `worker_threads`
    /// hung handlers stall dispatch on every queue.
    #[serde(with = "option_duration_ms")]
    pub handler_timeout: Option<Duration>,
    /// Age after which dead letters are purged
    #[serde(with = "duration_ms")]
    pub dead_letter_ttl: Duration,
    /// Period of the dead-letter expiry sweep
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Time in-flight handlers get to finish during shutdown
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

pub(crate) mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get().max(1),
            default_queue_capacity: 100,
            retry_policy: RetryPolicy::default(),
            poll_interval: Duration::from_millis(100),
            send_timeout: Duration::from_secs(5),
            handler_timeout: Some(Duration::from_secs(5 * 60)),
            dead_letter_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl MessageQueueConfig {
    /// Parse a configuration from TOML, filling omitted fields with defaults
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| RelayError::ConfigError(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the dispatcher cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(RelayError::ConfigError(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if self.default_queue_capacity == 0 {
            return Err(RelayError::ConfigError(
                "default_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(RelayError::ConfigError(
                "poll_interval must be non-zero".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(RelayError::ConfigError(
                "sweep_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Set worker pool size (builder pattern)
    pub fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    /// Set default queue capacity (builder pattern)
    pub fn with_default_queue_capacity(mut self, capacity: usize) -> Self {
        self.default_queue_capacity = capacity;
        self
    }

    /// Set retry policy (builder pattern)
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Set dispatcher poll interval (builder pattern)
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set producer backpressure timeout (builder pattern)
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Set handler timeout (builder pattern)
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    /// Let handlers run without a time limit (builder pattern)
    pub fn without_handler_timeout(mut self) -> Self {
        self.handler_timeout = None;
        self
    }

    /// Set dead-letter TTL (builder pattern)
    pub fn with_dead_letter_ttl(mut self, ttl: Duration) -> Self {
        self.dead_letter_ttl = ttl;
        self
    }

    /// Set dead-letter sweep period (builder pattern)
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set shutdown grace period (builder pattern)
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}
