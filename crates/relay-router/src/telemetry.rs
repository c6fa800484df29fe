//! Metrics facade for the dispatch engine.
//!
//! Prometheus-compatible counters and gauges via the `metrics` crate.
//! The exporter wiring lives outside this crate.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a finalised message with its outcome class.
pub fn record_message_processed(pool_code: &str, result: &str) {
    counter!(
        "relay_messages_processed_total",
        "pool" => pool_code.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// Record mediation latency.
pub fn record_mediation_latency(pool_code: &str, duration: Duration) {
    histogram!(
        "relay_mediation_duration_seconds",
        "pool" => pool_code.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a rate-limited wait.
pub fn record_rate_limited(pool_code: &str) {
    counter!(
        "relay_rate_limited_total",
        "pool" => pool_code.to_string()
    )
    .increment(1);
}

/// Record an admission rejection.
pub fn record_admission_rejected(pool_code: &str, reason: &str) {
    counter!(
        "relay_admission_rejected_total",
        "pool" => pool_code.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn set_pool_queue_size(pool_code: &str, size: u32) {
    gauge!(
        "relay_pool_queue_size",
        "pool" => pool_code.to_string()
    )
    .set(size as f64);
}

pub fn set_pool_active_workers(pool_code: &str, count: u32) {
    gauge!(
        "relay_pool_active_workers",
        "pool" => pool_code.to_string()
    )
    .set(count as f64);
}

pub fn set_in_flight_count(count: usize) {
    gauge!("relay_in_flight_messages").set(count as f64);
}

pub fn record_consumer_poll(consumer: &str, message_count: usize) {
    counter!(
        "relay_consumer_polls_total",
        "consumer" => consumer.to_string()
    )
    .increment(1);

    if message_count > 0 {
        counter!(
            "relay_consumer_messages_received_total",
            "consumer" => consumer.to_string()
        )
        .increment(message_count as u64);
    }
}

pub fn record_consumer_error(consumer: &str) {
    counter!(
        "relay_consumer_errors_total",
        "consumer" => consumer.to_string()
    )
    .increment(1);
}
