//! Prometheus metrics for the billing pipeline.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "billing_db_query_duration_seconds",
            "Database query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Gateway callbacks by kind and outcome
pub static CALLBACKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Delivery attempts by document type and result
pub static DELIVERY_ATTEMPTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Recipient-policy suppressions by document type and reason
pub static SUPPRESSIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Bill submissions by outcome (created / duplicate)
pub static SUBMISSIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    CALLBACKS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_gateway_callbacks_total",
                "Gateway callbacks received, by kind and outcome"
            ),
            &["kind", "outcome"]
        )
        .expect("Failed to register CALLBACKS_TOTAL")
    });

    DELIVERY_ATTEMPTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_delivery_attempts_total",
                "Notification delivery attempts, by document type and result"
            ),
            &["document_type", "result"]
        )
        .expect("Failed to register DELIVERY_ATTEMPTS_TOTAL")
    });

    SUPPRESSIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_delivery_suppressions_total",
                "Deliveries suppressed by recipient policy, by document type and reason"
            ),
            &["document_type", "reason"]
        )
        .expect("Failed to register SUPPRESSIONS_TOTAL")
    });

    SUBMISSIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "billing_submissions_total",
                "Bill submissions, by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register SUBMISSIONS_TOTAL")
    });
}

/// Render all registered metrics in the Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
