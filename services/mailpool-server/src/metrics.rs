//! Prometheus metrics exposition
//!
//! The library crates record through the `metrics` facade; this module
//! installs the recorder and adds the HTTP API series:
//!
//! - `api_requests_total` (counter): labels `status`, `route`
//! - `api_request_duration_seconds` (histogram): label `route`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("api_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The upper buckets cover long-polling `wait` requests, which can run for
/// the email wait timeout plus the HTTP timeout.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed API request against its route template.
pub fn record_request(status: u16, route: &str, duration_secs: f64) {
    metrics::counter!(
        "api_requests_total",
        "status" => status.to_string(),
        "route" => route.to_string()
    )
    .increment(1);
    metrics::histogram!("api_request_duration_seconds", "route" => route.to_string())
        .record(duration_secs);
}
