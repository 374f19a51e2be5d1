//! Metrics facade for the message router
//!
//! Emits counters, gauges and histograms through the `metrics` crate so any
//! installed recorder (Prometheus exporter, logging recorder) picks them up.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

pub fn record_message_processed(pool_code: &str, success: bool, result: &str) {
    counter!(
        "relay_messages_processed_total",
        "pool" => pool_code.to_string(),
        "success" => success.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

pub fn record_mediation_latency(pool_code: &str, duration: Duration) {
    histogram!(
        "relay_mediation_duration_seconds",
        "pool" => pool_code.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn record_rate_limit_exceeded(pool_code: &str) {
    counter!(
        "relay_rate_limit_exceeded_total",
        "pool" => pool_code.to_string()
    )
    .increment(1);
}

pub fn set_pool_buffer_size(pool_code: &str, size: u32) {
    gauge!(
        "relay_pool_buffer_size",
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

pub fn set_pool_available_permits(pool_code: &str, count: u32) {
    gauge!(
        "relay_pool_available_permits",
        "pool" => pool_code.to_string()
    )
    .set(count as f64);
}

pub fn set_pool_message_groups(pool_code: &str, count: u32) {
    gauge!(
        "relay_pool_message_groups",
        "pool" => pool_code.to_string()
    )
    .set(count as f64);
}

pub fn record_message_submitted(pool_code: &str) {
    counter!(
        "relay_messages_submitted_total",
        "pool" => pool_code.to_string()
    )
    .increment(1);
}

pub fn record_message_rejected(pool_code: &str, reason: &str) {
    counter!(
        "relay_messages_rejected_total",
        "pool" => pool_code.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn set_in_pipeline_count(count: usize) {
    gauge!("relay_in_pipeline_messages").set(count as f64);
}

pub fn record_consumer_poll(consumer: &str, message_count: u32) {
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

pub fn record_consumer_error(consumer: &str, error_type: &str) {
    counter!(
        "relay_consumer_errors_total",
        "consumer" => consumer.to_string(),
        "type" => error_type.to_string()
    )
    .increment(1);
}

pub fn set_queue_pending(queue: &str, count: u64) {
    gauge!(
        "relay_queue_pending_messages",
        "queue" => queue.to_string()
    )
    .set(count as f64);
}

pub fn set_queue_in_flight(queue: &str, count: u64) {
    gauge!(
        "relay_queue_in_flight_messages",
        "queue" => queue.to_string()
    )
    .set(count as f64);
}
