//! Prometheus metrics exposition
//!
//! - `gateway_requests_total` (counter): labels `provider`, `status`
//! - `gateway_request_duration_seconds` (histogram): label `provider`
//! - `gateway_dispatch_errors_total` (counter): labels `provider`, `kind`
//! - `token_refresh_total` (counter): labels `provider`, `outcome`

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering
/// metrics.
///
/// Configures `gateway_request_duration_seconds` with explicit buckets so
/// it renders as a histogram (`_bucket` lines for `histogram_quantile()`)
/// rather than the default summary. Boundaries cover 5ms to 60s, matching
/// the upstream timeout range.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(
                "gateway_request_duration_seconds".to_string(),
            ),
            &[
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
            ],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed dispatch with provider and status labels.
pub fn record_dispatch(provider: &str, status: u16, duration_secs: f64) {
    metrics::counter!(
        "gateway_requests_total",
        "provider" => provider.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!(
        "gateway_request_duration_seconds",
        "provider" => provider.to_string()
    )
    .record(duration_secs);
}

/// Record a terminal dispatch error with a classification label.
pub fn record_dispatch_error(provider: &str, kind: &str) {
    metrics::counter!(
        "gateway_dispatch_errors_total",
        "provider" => provider.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a forced token refresh outcome (admin surface).
pub fn record_refresh(provider: &str, outcome: &str) {
    metrics::counter!(
        "token_refresh_total",
        "provider" => provider.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}
