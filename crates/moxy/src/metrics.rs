//! Prometheus metrics for moxy.
//!
//! Tracks request traffic, terminal outcomes, TLS handshake failures and
//! notification backpressure drops.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_int_counter, CounterVec, Encoder, IntCounter, TextEncoder,
};

lazy_static! {
    /// Total number of requests observed by the proxy
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "moxy_requests_total",
        "Total number of requests observed by the proxy",
        &["method"]
    )
    .unwrap();

    /// Total number of responses delivered
    pub static ref RESPONSES_TOTAL: CounterVec = register_counter_vec!(
        "moxy_responses_total",
        "Total number of responses delivered",
        &["status"]
    )
    .unwrap();

    /// Total number of aborted requests
    pub static ref ABORTS_TOTAL: IntCounter = register_int_counter!(
        "moxy_aborts_total",
        "Total number of requests that terminated via the abort path"
    )
    .unwrap();

    /// Total number of failed TLS handshakes
    pub static ref TLS_FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "moxy_tls_failures_total",
        "Total number of failed TLS handshakes by classified cause",
        &["cause"]
    )
    .unwrap();

    /// Events dropped for slow subscribers
    pub static ref EVENTS_DROPPED_TOTAL: CounterVec = register_counter_vec!(
        "moxy_events_dropped_total",
        "Lifecycle events dropped because a subscriber queue was full",
        &["kind"]
    )
    .unwrap();
}

/// Render all registered metrics in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(error) = encoder.encode(&families, &mut buffer) {
        tracing::warn!(%error, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
