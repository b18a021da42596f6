//! OpenTelemetry export for the relay queue counters.
//!
//! The in-process [`QueueMetrics`](crate::QueueMetrics) stay authoritative; when
//! [`init_relay_metrics`] has been called every counter increment is mirrored
//! to an OpenTelemetry instrument tagged with the queue name.

use crate::metrics::{metric_names, Counter};
use opentelemetry::global;
use opentelemetry::metrics::Counter as OtelCounter;
use opentelemetry::KeyValue;
use std::sync::OnceLock;

// ============================================================================
// Attribute Constants
// ============================================================================

/// Queue name attribute
pub const ATTR_QUEUE: &str = "a3s.relay.queue";

/// Message identifier attribute
pub const ATTR_MESSAGE_ID: &str = "a3s.relay.message_id";

/// Retry attempt number
pub const ATTR_RETRY_ATTEMPT: &str = "a3s.relay.retry_attempt";

// ============================================================================
// Standalone Metrics (OnceLock pattern)
// ============================================================================

static METRICS: OnceLock<RelayMetricsRecorder> = OnceLock::new();

/// OpenTelemetry instruments for the relay counters.
pub struct RelayMetricsRecorder {
    pub messages_sent_total: OtelCounter<u64>,
    pub messages_processed_total: OtelCounter<u64>,
    pub messages_failed_total: OtelCounter<u64>,
    pub messages_retried_total: OtelCounter<u64>,
    pub messages_dead_lettered_total: OtelCounter<u64>,
    pub dead_letters_retried_total: OtelCounter<u64>,
    pub dead_letters_expired_total: OtelCounter<u64>,
    pub persistence_errors_total: OtelCounter<u64>,
    pub sweep_errors_total: OtelCounter<u64>,
}

impl RelayMetricsRecorder {
    fn instrument(&self, counter: Counter) -> &OtelCounter<u64> {
        match counter {
            Counter::Sent => &self.messages_sent_total,
            Counter::Processed => &self.messages_processed_total,
            Counter::Failed => &self.messages_failed_total,
            Counter::Retried => &self.messages_retried_total,
            Counter::DeadLettered => &self.messages_dead_lettered_total,
            Counter::DeadLetterRetried => &self.dead_letters_retried_total,
            Counter::DeadLetterExpired => &self.dead_letters_expired_total,
            Counter::PersistenceErrors => &self.persistence_errors_total,
        }
    }
}

/// Get the global relay metrics recorder (None if not initialized).
pub fn metrics() -> Option<&'static RelayMetricsRecorder> {
    METRICS.get()
}

/// OpenTelemetry instrument name for a metric: dots become underscores,
/// `_total` is appended.
pub fn instrument_name(metric: &str) -> String {
    format!("a3s_{}_total", metric.replace('.', "_"))
}

/// Initialize relay metrics using the global OpenTelemetry meter provider.
///
/// Safe to call multiple times; only the first call takes effect.
pub fn init_relay_metrics() {
    let meter = global::meter("a3s-relay");
    let counter = |metric: &str, description: &'static str| {
        meter
            .u64_counter(instrument_name(metric))
            .with_description(description)
            .init()
    };

    let recorder = RelayMetricsRecorder {
        messages_sent_total: counter(
            metric_names::MESSAGES_SENT,
            "Messages accepted by send",
        ),
        messages_processed_total: counter(
            metric_names::MESSAGES_PROCESSED,
            "Messages acknowledged by their handler",
        ),
        messages_failed_total: counter(
            metric_names::MESSAGES_FAILED,
            "Failed handler invocations",
        ),
        messages_retried_total: counter(
            metric_names::MESSAGES_RETRIED,
            "Messages re-enqueued after a backoff delay",
        ),
        messages_dead_lettered_total: counter(
            metric_names::MESSAGES_DEAD_LETTERED,
            "Messages moved to a dead-letter store",
        ),
        dead_letters_retried_total: counter(
            metric_names::DEAD_LETTERS_RETRIED,
            "Dead letters replayed into their queue",
        ),
        dead_letters_expired_total: counter(
            metric_names::DEAD_LETTERS_EXPIRED,
            "Dead letters purged by the expiry sweep",
        ),
        persistence_errors_total: counter(
            metric_names::PERSISTENCE_ERRORS,
            "Failed persist or delete calls",
        ),
        sweep_errors_total: counter(
            metric_names::SWEEP_ERRORS,
            "Failed dead-letter expiry sweeps",
        ),
    };

    let _ = METRICS.set(recorder);
}

/// Mirror a queue counter increment. No-op if metrics are not initialized.
pub(crate) fn record_counter(counter: Counter, queue: &str, value: u64) {
    if let Some(m) = metrics() {
        m.instrument(counter)
            .add(value, &[KeyValue::new(ATTR_QUEUE, queue.to_string())]);
    }
}

/// Mirror a failed sweep. No-op if metrics are not initialized.
pub(crate) fn record_sweep_error() {
    if let Some(m) = metrics() {
        m.sweep_errors_total.add(1, &[]);
    }
}
