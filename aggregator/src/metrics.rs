//! Prometheus metrics for the aggregation service

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram, register_histogram_vec, CounterVec, Encoder,
    Histogram, HistogramVec, TextEncoder,
};

// ── Query metrics ────────────────────────────────────────────────────────────

pub static QUERY_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("cdxfed_query_total", "Aggregate queries by outcome", &["status"]).unwrap()
});

pub static QUERY_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "cdxfed_query_dispatch_seconds",
        "Time from dispatch until every source answered or timed out",
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap()
});

// ── Per-source metrics ───────────────────────────────────────────────────────

pub static SOURCE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "cdxfed_source_duration_seconds",
        "Per-source lookup latency",
        &["source"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .unwrap()
});

pub static SOURCE_ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "cdxfed_source_errors_total",
        "Per-source errors by kind",
        &["source", "kind"]
    )
    .unwrap()
});

pub static BREAKER_SKIPS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "cdxfed_breaker_skips_total",
        "Dispatches skipped because the source's breaker was open",
        &["source"]
    )
    .unwrap()
});

/// Render all registered metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_includes_registered_metrics() {
        SOURCE_ERRORS.with_label_values(&["test-source", "timeout"]).inc();
        let text = encode_metrics();
        assert!(text.contains("cdxfed_source_errors_total"));
    }
}
