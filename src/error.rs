//! Error types for the relay queue
//!
//! All errors implement `std::error::Error` via `thiserror::Error`.
//!
//! # Error Handling
//!
//! The [`RelayError`] enum covers every failure the queue can report:
//! - Routing errors (queue not found, no handler registered)
//! - Delivery errors (handler failure, handler timeout)
//! - Collaborator errors (persistence failures)
//! - Lifecycle errors (queue full, shutdown in progress, bad configuration)
//!
//! Only send-time errors reach the producer. Handler and routing errors are
//! recorded on the resulting [`DeadLetter`](crate::DeadLetter) instead.
//!
//! # Example
//!
//! ```rust,ignore
//! use a3s_relay::{MessageQueue, RelayError};
//!
//! match queue.send("orders", order).await {
//!     Ok(id) => tracing::debug!(message_id = %id, "queued"),
//!     Err(RelayError::QueueNotFound(name)) => {
//!         eprintln!("Queue '{}' does not exist", name);
//!     }
//!     Err(RelayError::QueueFull { queue, .. }) => {
//!         eprintln!("Queue '{}' is saturated, try again later", queue);
//!     }
//!     Err(e) => eprintln!("Send failed: {}", e),
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

/// Relay queue error type
#[derive(Error, Debug)]
pub enum RelayError {
    /// Queue name was never created via `create_queue`
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// A message was dequeued from a queue without a registered handler
    #[error("No handler registered for queue: {0}")]
    NoHandler(String),

    /// The registered handler returned an error or panicked
    #[error("Handler execution error: {0}")]
    HandlerFailed(String),

    /// The persistence collaborator failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The queue stayed at capacity for the whole send timeout
    #[error("Queue '{queue}' is full (waited {timeout:?})")]
    QueueFull { queue: String, timeout: Duration },

    /// Handler exceeded the configured handler timeout
    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Shutdown in progress
    #[error("Queue is shutting down, not accepting new messages")]
    ShutdownInProgress,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Wrap a handler error, keeping its full cause chain in the message.
    pub fn handler(err: &anyhow::Error) -> Self {
        RelayError::HandlerFailed(format!("{:#}", err))
    }

    /// Whether this error came from the message handler rather than the queue.
    pub fn is_handler_error(&self) -> bool {
        matches!(self, RelayError::HandlerFailed(_) | RelayError::Timeout(_))
    }
}

/// Result type alias using RelayError
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_not_found_error() {
        let error = RelayError::QueueNotFound("orders".to_string());
        assert_eq!(error.to_string(), "Queue not found: orders");
    }

    #[test]
    fn test_no_handler_error() {
        let error = RelayError::NoHandler("orders".to_string());
        assert_eq!(error.to_string(), "No handler registered for queue: orders");
    }

    #[test]
    fn test_persistence_error() {
        let error = RelayError::Persistence("disk full".to_string());
        assert_eq!(error.to_string(), "Persistence error: disk full");
    }

    #[test]
    fn test_queue_full_error() {
        let error = RelayError::QueueFull {
            queue: "orders".to_string(),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(error.to_string(), "Queue 'orders' is full (waited 250ms)");
    }

    #[test]
    fn test_timeout_error() {
        let error = RelayError::Timeout(Duration::from_secs(5));
        assert_eq!(error.to_string(), "Handler timed out after 5s");
    }

    #[test]
    fn test_shutdown_in_progress_error() {
        let error = RelayError::ShutdownInProgress;
        assert_eq!(
            error.to_string(),
            "Queue is shutting down, not accepting new messages"
        );
    }

    #[test]
    fn test_handler_error_keeps_cause_chain() {
        let err = anyhow::anyhow!("connection refused").context("charging card");
        let error = RelayError::handler(&err);
        assert_eq!(
            error.to_string(),
            "Handler execution error: charging card: connection refused"
        );
        assert!(error.is_handler_error());
    }

    #[test]
    fn test_is_handler_error() {
        assert!(RelayError::Timeout(Duration::from_secs(1)).is_handler_error());
        assert!(!RelayError::NoHandler("q".to_string()).is_handler_error());
        assert!(!RelayError::Persistence("x".to_string()).is_handler_error());
    }

    #[test]
    fn test_error_debug() {
        let error = RelayError::QueueNotFound("test".to_string());
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("QueueNotFound"));
    }
}
